// 该文件是 Renlian （人脸） 项目的一部分。
// src/input/read_image_dir.rs - 图像目录输入
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

use std::{path::PathBuf, vec::IntoIter};

use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::EncodedFrame, url_path};

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

#[derive(Error, Debug)]
pub enum ImageDirInputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// `folder:///path/dir`，按文件名顺序逐个读取目录中的图像
pub struct ImageDirInput {
  files: Vec<PathBuf>,
}

impl FromUrlWithScheme for ImageDirInput {
  const SCHEME: &'static str = "folder";
}

fn is_image(path: &std::path::Path) -> bool {
  path
    .extension()
    .and_then(|ext| ext.to_str())
    .map(|ext| {
      IMAGE_EXTENSIONS
        .iter()
        .any(|known| known.eq_ignore_ascii_case(ext))
    })
    .unwrap_or(false)
}

impl FromUrl for ImageDirInput {
  type Error = ImageDirInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ImageDirInputError::SchemeMismatch);
    }

    let directory = PathBuf::from(url_path(url));
    let mut files = Vec::new();
    for entry in std::fs::read_dir(&directory)? {
      let path = entry?.path();
      if path.is_file() && is_image(&path) {
        files.push(path);
      }
    }
    files.sort();

    info!("目录 {} 中有 {} 张图像", directory.display(), files.len());
    Ok(ImageDirInput { files })
  }
}

impl ImageDirInput {
  pub fn files(&self) -> &[PathBuf] {
    &self.files
  }

  pub fn into_frames(self) -> ImageDirInputIter {
    ImageDirInputIter {
      files: self.files.into_iter(),
    }
  }
}

pub struct ImageDirInputIter {
  files: IntoIter<PathBuf>,
}

impl Iterator for ImageDirInputIter {
  type Item = EncodedFrame;

  fn next(&mut self) -> Option<Self::Item> {
    for path in self.files.by_ref() {
      match std::fs::read(&path) {
        Ok(data) => return Some(EncodedFrame::new(path.display().to_string(), data)),
        Err(e) => error!("读取图像 {} 失败，跳过: {}", path.display(), e),
      }
    }
    None
  }
}
