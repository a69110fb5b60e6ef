// 该文件是 Renlian （人脸） 项目的一部分。
// src/model/decode.rs - 检测结果解码
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

use std::sync::OnceLock;

use tracing::debug;

use crate::model::{
  Anchor, AnchorGeometry, AnchorTable, BoundingBox, Detection, DetectionParams, DetectorError,
  Point, nms, rank_scores,
};

/// 解码方差 (v0, v1)
pub const VARIANCES: [f64; 2] = [0.1, 0.2];

const BBOX_STRIDE: usize = 4;
const SCORE_STRIDE: usize = 2;
const LANDMARK_STRIDE: usize = 10;
/// 分数张量每行为 (背景, 人脸)
const FACE_SCORE_COLUMN: usize = 1;

pub fn decode_bbox(offsets: &[f32], anchor: &Anchor) -> BoundingBox {
  let (cx, cy) = (anchor.center_x as f64, anchor.center_y as f64);
  let (aw, ah) = (anchor.base_width as f64, anchor.base_height as f64);

  let width = (offsets[2] as f64 * VARIANCES[1]).exp() * aw;
  let height = (offsets[3] as f64 * VARIANCES[1]).exp() * ah;
  let x = offsets[0] as f64 * VARIANCES[0] * aw + cx - width / 2.0;
  let y = offsets[1] as f64 * VARIANCES[0] * ah + cy - height / 2.0;

  BoundingBox {
    x: x as f32,
    y: y as f32,
    width: width as f32,
    height: height as f32,
  }
}

pub fn decode_landmarks(offsets: &[f32], anchor: &Anchor) -> [Point; 5] {
  let (cx, cy) = (anchor.center_x as f64, anchor.center_y as f64);
  let (aw, ah) = (anchor.base_width as f64, anchor.base_height as f64);

  std::array::from_fn(|i| Point {
    x: (offsets[2 * i] as f64 * VARIANCES[0] * aw + cx) as f32,
    y: (offsets[2 * i + 1] as f64 * VARIANCES[0] * ah + cy) as f32,
  })
}

/// 单个切片的原始输出，按先验框顺序排列
#[derive(Debug, Clone, Copy)]
pub struct RawTile<'a> {
  pub bbox: &'a [f32],
  pub score: &'a [f32],
  pub landmark: &'a [f32],
}

/// 人脸解码器，先验框表在第一次使用时生成且只生成一次
#[derive(Debug, Default)]
pub struct FaceDecoder {
  geometry: AnchorGeometry,
  anchors: OnceLock<AnchorTable>,
}

impl FaceDecoder {
  pub fn new(geometry: AnchorGeometry) -> Self {
    Self {
      geometry,
      anchors: OnceLock::new(),
    }
  }

  pub fn geometry(&self) -> &AnchorGeometry {
    &self.geometry
  }

  pub fn anchors(&self) -> &AnchorTable {
    self
      .anchors
      .get_or_init(|| AnchorTable::generate(&self.geometry))
  }

  fn check_len(name: &str, data: &[f32], expected: usize) -> Result<(), DetectorError> {
    if data.len() != expected {
      return Err(DetectorError::OutputLength {
        name: name.to_string(),
        expected,
        actual: data.len(),
      });
    }
    Ok(())
  }

  /// 切片内的一级处理：按分数取前 `keep_before_nms` 个、解码、NMS
  ///
  /// 返回切片局部归一化坐标下的检测结果，按分数降序。
  pub fn decode_tile(
    &self,
    raw: &RawTile<'_>,
    params: &DetectionParams,
  ) -> Result<Vec<Detection>, DetectorError> {
    let anchors = self.anchors();
    let count = anchors.len();
    Self::check_len("bbox", raw.bbox, count * BBOX_STRIDE)?;
    Self::check_len("score", raw.score, count * SCORE_STRIDE)?;
    Self::check_len("landmark", raw.landmark, count * LANDMARK_STRIDE)?;

    let face_scores: Vec<f32> = raw
      .score
      .chunks_exact(SCORE_STRIDE)
      .map(|row| row[FACE_SCORE_COLUMN])
      .collect();
    let ranked = rank_scores(&face_scores, params.keep_before_nms);

    let boxes: Vec<BoundingBox> = ranked
      .iter()
      .map(|&(index, _)| {
        let offset = index * BBOX_STRIDE;
        decode_bbox(&raw.bbox[offset..offset + BBOX_STRIDE], &anchors.as_slice()[index])
      })
      .collect();
    let scores: Vec<f32> = ranked.iter().map(|&(_, score)| score).collect();

    let kept = nms(
      &boxes,
      &scores,
      params.score_threshold,
      params.nms_threshold,
      params.top_k,
    );

    let detections: Vec<Detection> = kept
      .into_iter()
      .map(|k| {
        let index = ranked[k].0;
        let offset = index * LANDMARK_STRIDE;
        Detection {
          bbox: boxes[k],
          score: scores[k],
          landmarks: decode_landmarks(
            &raw.landmark[offset..offset + LANDMARK_STRIDE],
            &anchors.as_slice()[index],
          ),
        }
      })
      .collect();

    debug!(
      "切片候选 {} 个，NMS 后保留 {} 个",
      ranked.len(),
      detections.len()
    );
    Ok(detections)
  }
}
