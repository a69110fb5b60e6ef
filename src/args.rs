// 该文件是 Renlian （人脸） 项目的一部分。
// src/args.rs - 命令行参数
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

use clap::Args;
use tracing_subscriber::EnvFilter;
use url::Url;

use crate::model::DetectionParams;

/// 模型、输入和输出
#[derive(Args, Debug, Clone)]
pub struct IoArgs {
  /// 模型，例如 retinaface:///path/model.onnx?batch=4
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源，image:///path/file.jpg 或 folder:///path/dir
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径，image:///path/out.png 或 folder:///path/dir?record&always
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
}

/// 检测参数，未指定时使用服务端参数
#[derive(Args, Debug, Clone)]
pub struct DetectionArgs {
  /// 启用滑窗切片
  #[arg(long)]
  pub slide: Option<bool>,
  /// NMS IoU 阈值 (0.0 - 1.0)
  #[arg(long, value_name = "THRESHOLD")]
  pub nms_threshold: Option<f32>,
  /// 分数阈值 (0.0 - 1.0)
  #[arg(long, value_name = "THRESHOLD")]
  pub score_threshold: Option<f32>,
  /// 每个切片 NMS 前保留的候选数
  #[arg(long, value_name = "COUNT")]
  pub keep_before_nms: Option<usize>,
  /// NMS 后保留的最大数量，0 表示不限
  #[arg(long, value_name = "COUNT")]
  pub top_k: Option<usize>,
}

impl From<&DetectionArgs> for DetectionParams {
  fn from(args: &DetectionArgs) -> Self {
    let base = DetectionParams::service();
    DetectionParams {
      slide: args.slide.unwrap_or(base.slide),
      nms_threshold: args.nms_threshold.unwrap_or(base.nms_threshold),
      score_threshold: args.score_threshold.unwrap_or(base.score_threshold),
      keep_before_nms: args.keep_before_nms.unwrap_or(base.keep_before_nms),
      top_k: args.top_k.unwrap_or(base.top_k),
    }
  }
}

/// 安装日志输出，RUST_LOG 未设置时为 info
pub fn init_tracing() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();
}
