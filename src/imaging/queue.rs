//! Transformation queue.
//!
//! Operations are enqueued with a [`Priority`] and run as one batch in
//! priority order; operations sharing a priority keep their enqueue order
//! (filter chains rely on this). The order matters: a border added after
//! rounded corners must see the final outline.

use super::codec::ImagingError;
use super::transforms::Transform;
use image::DynamicImage;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Position of an operation in the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    ResizeOrCrop = 0,
    Flip = 1,
    Filter = 2,
    Text = 3,
    Watermark = 4,
    RoundedCorners = 5,
    Border = 6,
    Reflection = 7,
    Rotate = 8,
}

#[derive(Clone)]
struct Queued {
    priority: Priority,
    op: Arc<dyn Transform>,
}

/// Wall-clock time spent in one operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpTiming {
    pub name: String,
    #[serde(serialize_with = "serialize_ms")]
    pub elapsed: Duration,
}

fn serialize_ms<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64() * 1000.0)
}

#[derive(Default, Clone)]
pub struct TransformQueue {
    ops: Vec<Queued>,
}

impl TransformQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, priority: Priority, op: impl Transform + 'static) {
        self.push_boxed(priority, Box::new(op));
    }

    pub fn push_boxed(&mut self, priority: Priority, op: Box<dyn Transform>) {
        self.ops.push(Queued {
            priority,
            op: Arc::from(op),
        });
    }

    /// A copy with the operations at `priority` swapped for `op`.
    pub fn replacing(&self, priority: Priority, op: impl Transform + 'static) -> TransformQueue {
        let mut queue = TransformQueue {
            ops: self.ops.iter().filter(|q| q.priority != priority).cloned().collect(),
        };
        queue.push(priority, op);
        queue
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn contains(&self, priority: Priority) -> bool {
        self.ops.iter().any(|q| q.priority == priority)
    }

    /// Operation names in execution order.
    pub fn names(&self) -> Vec<String> {
        self.ordered().map(|q| q.op.name().to_string()).collect()
    }

    fn ordered(&self) -> impl Iterator<Item = &Queued> {
        let mut ordered: Vec<&Queued> = self.ops.iter().collect();
        ordered.sort_by_key(|q| q.priority);
        ordered.into_iter()
    }

    /// Run every operation in order. The first failure aborts the batch.
    pub fn run(&self, img: DynamicImage) -> Result<(DynamicImage, Vec<OpTiming>), ImagingError> {
        let mut img = img;
        let mut timings = Vec::with_capacity(self.ops.len());
        for queued in self.ordered() {
            let name = queued.op.name().to_string();
            let start = Instant::now();
            img = queued.op.apply(img).map_err(|e| match e {
                ImagingError::Operation { .. } => e,
                other => ImagingError::Operation {
                    op: name.clone(),
                    message: other.to_string(),
                },
            })?;
            let elapsed = start.elapsed();
            debug!(op = %name, ?elapsed, "applied");
            timings.push(OpTiming { name, elapsed });
        }
        Ok((img, timings))
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records its name into a shared log when applied.
    pub struct RecordingTransform {
        pub label: &'static str,
        pub log: Arc<Mutex<Vec<&'static str>>>,
        pub fail: bool,
    }

    impl RecordingTransform {
        pub fn new(label: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> Self {
            Self {
                label,
                log: Arc::clone(log),
                fail: false,
            }
        }
    }

    impl Transform for RecordingTransform {
        fn name(&self) -> &str {
            self.label
        }

        fn apply(&self, img: DynamicImage) -> Result<DynamicImage, ImagingError> {
            self.log.lock().unwrap().push(self.label);
            if self.fail {
                return Err(ImagingError::Decode("boom".into()));
            }
            Ok(img)
        }
    }

    #[test]
    fn runs_in_priority_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut queue = TransformQueue::new();
        queue.push(Priority::Rotate, RecordingTransform::new("rotate", &log));
        queue.push(Priority::Border, RecordingTransform::new("border", &log));
        queue.push(Priority::ResizeOrCrop, RecordingTransform::new("resize", &log));
        queue.push(Priority::RoundedCorners, RecordingTransform::new("corners", &log));
        queue.push(Priority::Flip, RecordingTransform::new("flip", &log));

        let (_, timings) = queue.run(DynamicImage::new_rgb8(2, 2)).unwrap();
        let expected = vec!["resize", "flip", "corners", "border", "rotate"];
        assert_eq!(*log.lock().unwrap(), expected);
        assert_eq!(timings.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(), expected);
        assert_eq!(queue.names(), expected);
    }

    #[test]
    fn same_priority_keeps_enqueue_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut queue = TransformQueue::new();
        queue.push(Priority::Filter, RecordingTransform::new("blur", &log));
        queue.push(Priority::Filter, RecordingTransform::new("sepia", &log));
        queue.push(Priority::Filter, RecordingTransform::new("negate", &log));
        queue.run(DynamicImage::new_rgb8(1, 1)).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["blur", "sepia", "negate"]);
    }

    #[test]
    fn failure_aborts_batch() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut queue = TransformQueue::new();
        let mut failing = RecordingTransform::new("bad", &log);
        failing.fail = true;
        queue.push(Priority::Flip, failing);
        queue.push(Priority::Rotate, RecordingTransform::new("rotate", &log));

        let err = queue.run(DynamicImage::new_rgb8(1, 1)).unwrap_err();
        assert!(matches!(err, ImagingError::Operation { ref op, .. } if op == "bad"));
        assert_eq!(*log.lock().unwrap(), vec!["bad"]);
    }

    #[test]
    fn replacing_swaps_one_priority() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut queue = TransformQueue::new();
        queue.push(Priority::Rotate, RecordingTransform::new("rotate", &log));
        queue.push(Priority::ResizeOrCrop, RecordingTransform::new("resize", &log));
        let copy = queue.replacing(Priority::ResizeOrCrop, RecordingTransform::new("crop", &log));
        assert_eq!(copy.names(), vec!["crop", "rotate"]);
        assert_eq!(queue.names(), vec!["resize", "rotate"]);
    }

    #[test]
    fn contains_priority() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut queue = TransformQueue::new();
        assert!(queue.is_empty());
        queue.push(Priority::RoundedCorners, RecordingTransform::new("c", &log));
        assert!(queue.contains(Priority::RoundedCorners));
        assert!(!queue.contains(Priority::Border));
        assert_eq!(queue.len(), 1);
    }
}
