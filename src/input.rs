// 该文件是 Renlian （人脸） 项目的一部分。
// src/input.rs - 图像输入
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

use crate::{FromUrl, frame::EncodedFrame};

#[cfg(feature = "read_image_file")]
mod read_image_file;
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::{ImageFileInput, ImageFileInputError, ImageFileInputIter};

#[cfg(feature = "read_image_dir")]
mod read_image_dir;
#[cfg(feature = "read_image_dir")]
pub use self::read_image_dir::{ImageDirInput, ImageDirInputError, ImageDirInputIter};

#[derive(Error, Debug)]
pub enum InputError {
  #[cfg(feature = "read_image_file")]
  #[error("图像文件输入错误: {0}")]
  ImageFileInputError(#[from] ImageFileInputError),
  #[cfg(feature = "read_image_dir")]
  #[error("图像目录输入错误: {0}")]
  ImageDirInputError(#[from] ImageDirInputError),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

pub enum InputWrapper {
  #[cfg(feature = "read_image_file")]
  ReadImageFile(ImageFileInput),
  #[cfg(feature = "read_image_dir")]
  ReadImageDir(ImageDirInput),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "read_image_file")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == ImageFileInput::SCHEME {
        let input = ImageFileInput::from_url(url)?;
        return Ok(InputWrapper::ReadImageFile(input));
      }
    }
    #[cfg(feature = "read_image_dir")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == ImageDirInput::SCHEME {
        let input = ImageDirInput::from_url(url)?;
        return Ok(InputWrapper::ReadImageDir(input));
      }
    }
    Err(InputError::SchemeMismatch)
  }
}

impl InputWrapper {
  pub fn into_frames(self) -> InputWrapperIter {
    match self {
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => InputWrapperIter::ReadImageFile(input.into_frames()),
      #[cfg(feature = "read_image_dir")]
      InputWrapper::ReadImageDir(input) => InputWrapperIter::ReadImageDir(input.into_frames()),
    }
  }
}

pub enum InputWrapperIter {
  #[cfg(feature = "read_image_file")]
  ReadImageFile(ImageFileInputIter),
  #[cfg(feature = "read_image_dir")]
  ReadImageDir(ImageDirInputIter),
}

impl Iterator for InputWrapperIter {
  type Item = EncodedFrame;

  fn next(&mut self) -> Option<Self::Item> {
    match self {
      #[cfg(feature = "read_image_file")]
      InputWrapperIter::ReadImageFile(input) => input.next(),
      #[cfg(feature = "read_image_dir")]
      InputWrapperIter::ReadImageDir(input) => input.next(),
    }
  }
}
