// 该文件是 Renlian （人脸） 项目的一部分。
// src/bin/simple_oneshot.rs - 单张图像人脸检测
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

use anyhow::Result;
use clap::Parser;
use tracing::info;

use renlian::{
  FromUrl,
  args::{DetectionArgs, IoArgs, init_tracing},
  input::InputWrapper,
  model::RetinaFaceBuilder,
  output::OutputWrapper,
  service::FaceDetectionService,
  task::{OneShotTask, Task},
};

/// Renlian 单张图像检测
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  #[command(flatten)]
  pub io: IoArgs,
  #[command(flatten)]
  pub detection: DetectionArgs,
}

fn main() -> Result<()> {
  init_tracing();

  let args = Args::parse();

  info!("模型: {}", args.io.model);
  info!("输入来源: {}", args.io.input);
  info!("输出路径: {}", args.io.output);

  let input = InputWrapper::from_url(&args.io.input)?;
  let detector = RetinaFaceBuilder::from_url(&args.io.model)?.build()?;
  let service = FaceDetectionService::with_params(detector, (&args.detection).into());
  let output = OutputWrapper::from_url(&args.io.output)?;

  OneShotTask.run_task(input.into_frames(), service, output)?;

  Ok(())
}
