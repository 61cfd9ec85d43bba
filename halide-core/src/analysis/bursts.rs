//! Burst sequence detection.
//!
//! A burst is a run of images from one camera whose consecutive capture
//! times stay within a gap threshold, subject to minimum size and duration.
//! Pure time-gap clustering, no ML.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use halide_model::{ImageId, SelectionMethod};

/// Projection of an image row carrying everything burst detection needs.
/// Serializable because the single-pass burst job ships the whole snapshot
/// through its work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BurstImage {
    pub id: ImageId,
    pub timestamp: Option<DateTime<Utc>>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub quality_score: Option<i32>,
}

impl BurstImage {
    /// Partition key; images with no camera metadata cluster together.
    fn camera_key(&self) -> (Option<&str>, Option<&str>) {
        (self.camera_make.as_deref(), self.camera_model.as_deref())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BurstParams {
    /// Maximum seconds between consecutive images.
    pub gap_threshold: f64,
    /// Minimum images to form a burst.
    pub min_size: usize,
    /// Minimum total duration in seconds.
    pub min_duration: f64,
}

impl Default for BurstParams {
    fn default() -> Self {
        Self {
            gap_threshold: 1.0,
            min_size: 3,
            min_duration: 0.5,
        }
    }
}

/// A detected sequence before persistence. `image_ids` are in capture order.
#[derive(Debug, Clone, PartialEq)]
pub struct BurstCandidate {
    pub image_ids: Vec<ImageId>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: f64,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
}

/// Detect bursts across a catalog snapshot. Images are partitioned by
/// camera, each partition sorted by ascending timestamp, and consecutive
/// gaps above the threshold (or missing timestamps) terminate a sequence.
pub fn detect_bursts(images: &[BurstImage], params: &BurstParams) -> Vec<BurstCandidate> {
    if images.len() < params.min_size {
        return Vec::new();
    }

    let mut partitions: Vec<(&BurstImage, Vec<&BurstImage>)> = Vec::new();
    for img in images {
        match partitions
            .iter_mut()
            .find(|(repr, _)| repr.camera_key() == img.camera_key())
        {
            Some((_, members)) => members.push(img),
            None => partitions.push((img, vec![img])),
        }
    }

    let mut bursts = Vec::new();
    for (_, mut members) in partitions {
        members.sort_by_key(|img| img.timestamp);
        bursts.extend(find_sequences(&members, params));
    }

    bursts.sort_by_key(|b| b.start_time);
    bursts
}

fn find_sequences(sorted: &[&BurstImage], params: &BurstParams) -> Vec<BurstCandidate> {
    let mut bursts = Vec::new();
    let Some(first) = sorted.first() else {
        return bursts;
    };

    let mut current: Vec<&BurstImage> = vec![first];
    for pair in sorted.windows(2) {
        let gap = match (pair[0].timestamp, pair[1].timestamp) {
            (Some(prev), Some(next)) => (next - prev).num_milliseconds() as f64 / 1000.0,
            // A missing timestamp always terminates the sequence.
            _ => f64::INFINITY,
        };

        if gap <= params.gap_threshold {
            current.push(pair[1]);
        } else {
            if let Some(burst) = make_burst(&current, params) {
                bursts.push(burst);
            }
            current = vec![pair[1]];
        }
    }

    if let Some(burst) = make_burst(&current, params) {
        bursts.push(burst);
    }

    bursts
}

fn make_burst(images: &[&BurstImage], params: &BurstParams) -> Option<BurstCandidate> {
    if images.len() < params.min_size {
        return None;
    }

    let timestamps: Vec<DateTime<Utc>> = images.iter().filter_map(|img| img.timestamp).collect();
    if timestamps.len() < 2 {
        return None;
    }

    let start = *timestamps.iter().min().unwrap();
    let end = *timestamps.iter().max().unwrap();
    let duration = (end - start).num_milliseconds() as f64 / 1000.0;
    if duration < params.min_duration {
        return None;
    }

    Some(BurstCandidate {
        image_ids: images.iter().map(|img| img.id.clone()).collect(),
        start_time: start,
        end_time: end,
        duration_seconds: duration,
        camera_make: images[0].camera_make.clone(),
        camera_model: images[0].camera_model.clone(),
    })
}

/// Pick the representative of a burst. `images` must be in capture order.
pub fn select_best(images: &[BurstImage], method: SelectionMethod) -> Option<ImageId> {
    if images.is_empty() {
        return None;
    }
    let chosen = match method {
        SelectionMethod::First => &images[0],
        SelectionMethod::Middle => &images[images.len() / 2],
        SelectionMethod::Quality => images
            .iter()
            .max_by_key(|img| img.quality_score.unwrap_or(0))?,
    };
    Some(chosen.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    fn img(id: &str, ts_millis: Option<i64>, camera: Option<&str>, quality: Option<i32>) -> BurstImage {
        BurstImage {
            id: ImageId::from(id),
            timestamp: ts_millis.map(at),
            camera_make: camera.map(str::to_string),
            camera_model: None,
            quality_score: quality,
        }
    }

    #[test]
    fn four_rapid_canon_shots_form_one_burst() {
        // t = 0.0, 0.4, 0.9, 1.4s; gaps 0.4, 0.5, 0.5 all within 1.0.
        let images = vec![
            img("a", Some(0), Some("Canon"), Some(60)),
            img("b", Some(400), Some("Canon"), Some(80)),
            img("c", Some(900), Some("Canon"), Some(75)),
            img("d", Some(1400), Some("Canon"), Some(40)),
        ];
        let bursts = detect_bursts(&images, &BurstParams::default());
        assert_eq!(bursts.len(), 1);
        let burst = &bursts[0];
        assert_eq!(burst.image_ids.len(), 4);
        assert_eq!(burst.duration_seconds, 1.4);
        assert_eq!(burst.camera_make.as_deref(), Some("Canon"));

        let members: Vec<BurstImage> = images
            .iter()
            .filter(|i| burst.image_ids.contains(&i.id))
            .cloned()
            .collect();
        assert_eq!(
            select_best(&members, SelectionMethod::Quality),
            Some(ImageId::from("b"))
        );
    }

    #[test]
    fn mixed_cameras_split_into_separate_bursts() {
        let images = vec![
            img("c1", Some(0), Some("Canon"), None),
            img("n1", Some(200), Some("Nikon"), None),
            img("c2", Some(400), Some("Canon"), None),
            img("n2", Some(600), Some("Nikon"), None),
        ];
        let params = BurstParams {
            min_size: 2,
            min_duration: 0.0,
            ..Default::default()
        };
        let bursts = detect_bursts(&images, &params);
        assert_eq!(bursts.len(), 2);
        assert!(bursts
            .iter()
            .any(|b| b.image_ids == vec![ImageId::from("c1"), ImageId::from("c2")]));
        assert!(bursts
            .iter()
            .any(|b| b.image_ids == vec![ImageId::from("n1"), ImageId::from("n2")]));
    }

    #[test]
    fn wide_gap_terminates_a_sequence() {
        let images = vec![
            img("a", Some(0), Some("Canon"), None),
            img("b", Some(500), Some("Canon"), None),
            img("c", Some(1000), Some("Canon"), None),
            // 10s gap, then a too-short tail.
            img("d", Some(11_000), Some("Canon"), None),
        ];
        let bursts = detect_bursts(&images, &BurstParams::default());
        assert_eq!(bursts.len(), 1);
        assert_eq!(bursts[0].image_ids.len(), 3);
    }

    #[test]
    fn short_duration_bursts_are_dropped() {
        // Three shots within 0.2s: size ok, duration below 0.5s.
        let images = vec![
            img("a", Some(0), Some("Canon"), None),
            img("b", Some(100), Some("Canon"), None),
            img("c", Some(200), Some("Canon"), None),
        ];
        assert!(detect_bursts(&images, &BurstParams::default()).is_empty());
    }

    #[test]
    fn missing_timestamp_is_never_part_of_a_burst() {
        let images = vec![
            img("a", Some(0), Some("Canon"), None),
            img("b", Some(400), Some("Canon"), None),
            img("c", None, Some("Canon"), None),
            img("d", Some(800), Some("Canon"), None),
        ];
        // The undated image sorts first and the infinite gap cuts it off;
        // the dated images still cluster.
        let bursts = detect_bursts(&images, &BurstParams::default());
        assert_eq!(bursts.len(), 1);
        assert_eq!(
            bursts[0].image_ids,
            vec![ImageId::from("a"), ImageId::from("b"), ImageId::from("d")]
        );
    }

    #[test]
    fn null_camera_forms_its_own_partition() {
        let images = vec![
            img("a", Some(0), None, None),
            img("b", Some(300), None, None),
            img("c", Some(600), Some("Canon"), None),
        ];
        let params = BurstParams {
            min_size: 2,
            min_duration: 0.0,
            ..Default::default()
        };
        let bursts = detect_bursts(&images, &params);
        assert_eq!(bursts.len(), 1);
        assert_eq!(
            bursts[0].image_ids,
            vec![ImageId::from("a"), ImageId::from("b")]
        );
        assert!(bursts[0].camera_make.is_none());
    }

    #[test]
    fn selection_methods_pick_first_and_middle() {
        let images = vec![
            img("a", Some(0), None, Some(10)),
            img("b", Some(100), None, Some(99)),
            img("c", Some(200), None, Some(50)),
        ];
        assert_eq!(
            select_best(&images, SelectionMethod::First),
            Some(ImageId::from("a"))
        );
        assert_eq!(
            select_best(&images, SelectionMethod::Middle),
            Some(ImageId::from("b"))
        );
        assert_eq!(select_best(&[], SelectionMethod::Quality), None);
    }
}
