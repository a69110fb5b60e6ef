// 该文件是 Renlian （人脸） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::EncodedFrame, url_path};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// `image:///path/file.jpg`，只产生一帧
pub struct ImageFileInput {
  frame: Option<EncodedFrame>,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemeMismatch);
    }

    let path = url_path(url);
    let data = std::fs::read(&path)?;
    debug!("读取图像文件 {}，{} 字节", path, data.len());

    Ok(ImageFileInput {
      frame: Some(EncodedFrame::new(path, data)),
    })
  }
}

impl ImageFileInput {
  pub fn into_frames(self) -> ImageFileInputIter {
    ImageFileInputIter { inner: self }
  }
}

pub struct ImageFileInputIter {
  inner: ImageFileInput,
}

impl Iterator for ImageFileInputIter {
  type Item = EncodedFrame;

  fn next(&mut self) -> Option<Self::Item> {
    self.inner.frame.take()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn yields_the_file_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("face.jpg");
    std::fs::write(&path, b"jpeg bytes").unwrap();

    let url = Url::parse(&format!("image://{}", path.display())).unwrap();
    let mut frames = ImageFileInput::from_url(&url).unwrap().into_frames();

    let frame = frames.next().unwrap();
    assert_eq!(frame.data(), b"jpeg bytes");
    assert!(frames.next().is_none());
  }

  #[test]
  fn missing_file_is_an_io_error() {
    let url = Url::parse("image:///definitely/not/here.png").unwrap();
    assert!(matches!(
      ImageFileInput::from_url(&url),
      Err(ImageFileInputError::IoError(_))
    ));
  }
}
