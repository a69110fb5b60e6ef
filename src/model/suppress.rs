// 该文件是 Renlian （人脸） 项目的一部分。
// src/model/suppress.rs - 非极大值抑制
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

use std::cmp::Ordering;

use crate::model::BoundingBox;

fn rank_key(score: f32) -> f32 {
  if score.is_nan() {
    f32::NEG_INFINITY
  } else {
    score
  }
}

/// 分数降序，分数相同时按原始下标升序
fn by_score_then_index(a: &(usize, f32), b: &(usize, f32)) -> Ordering {
  rank_key(b.1)
    .total_cmp(&rank_key(a.1))
    .then_with(|| a.0.cmp(&b.0))
}

/// 按分数排序后保留前 `keep` 个 (下标, 分数)
pub fn rank_scores(scores: &[f32], keep: usize) -> Vec<(usize, f32)> {
  let mut ranked: Vec<(usize, f32)> = scores.iter().copied().enumerate().collect();
  ranked.sort_by(by_score_then_index);
  ranked.truncate(keep);
  ranked
}

/// 贪心 NMS
///
/// 只考虑分数严格大于 `score_threshold` 的框，依次保留剩余最高分的框，
/// 丢弃与其 IoU 超过 `nms_threshold` 的框，最多保留 `top_k` 个，`top_k` 为 0 时不限数量。
/// 返回保留框的下标，按分数降序排列。
pub fn nms(
  boxes: &[BoundingBox],
  scores: &[f32],
  score_threshold: f32,
  nms_threshold: f32,
  top_k: usize,
) -> Vec<usize> {
  let mut candidates: Vec<(usize, f32)> = scores
    .iter()
    .copied()
    .enumerate()
    .take(boxes.len())
    .filter(|&(_, score)| score > score_threshold)
    .collect();
  candidates.sort_by(by_score_then_index);

  let mut kept: Vec<usize> = Vec::new();
  for (index, _) in candidates {
    if top_k > 0 && kept.len() >= top_k {
      break;
    }
    let overlaps = kept
      .iter()
      .any(|&k| boxes[k].iou(&boxes[index]) > nms_threshold);
    if !overlaps {
      kept.push(index);
    }
  }
  kept
}
