// 该文件是 Renlian （人脸） 项目的一部分。
// src/frame.rs - 编码图像帧
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

use image::RgbImage;

/// 一帧尚未解码的图像数据（PNG、JPEG 等）及其来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
  source: String,
  data: Vec<u8>,
}

impl EncodedFrame {
  pub fn new(source: impl Into<String>, data: Vec<u8>) -> Self {
    Self {
      source: source.into(),
      data,
    }
  }

  pub fn source(&self) -> &str {
    &self.source
  }

  pub fn data(&self) -> &[u8] {
    &self.data
  }

  pub fn into_data(self) -> Vec<u8> {
    self.data
  }

  pub fn decode(&self) -> Result<RgbImage, image::ImageError> {
    Ok(image::load_from_memory(&self.data)?.to_rgb8())
  }
}
