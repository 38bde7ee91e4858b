use std::{path::Path, sync::Arc};

use image::{imageops::FilterType, DynamicImage};
use serde::{ser::Serializer, Serialize};
use thiserror::Error;
use tokio::sync::OnceCell;

/// Side length of the square RGB input the classifier was trained on.
pub const INPUT_SIZE: u32 = 299;
pub const INPUT_LEN: usize = (INPUT_SIZE * INPUT_SIZE * 3) as usize;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("failed to decode image {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to load model {path}: {message}")]
    Load { path: String, message: String },
    #[error("model execution failed: {0}")]
    Model(String),
    #[error("model returned {got} scores for {expected} classes")]
    OutputLength { expected: usize, got: usize },
    #[error("model loader task failed: {0}")]
    Task(String),
}

/// A loaded image classifier.
///
/// `forward` receives one preprocessed image laid out as NHWC `1x299x299x3`
/// and returns one score per class, in class-list order.
pub trait Classifier: Send + Sync {
    fn forward(&self, input: &[f32]) -> Result<Vec<f32>, InferenceError>;
}

pub type ModelLoader = Arc<dyn Fn() -> Result<Arc<dyn Classifier>, InferenceError> + Send + Sync>;

/// Single model slot shared by all requests.
///
/// The loader runs at most once successfully; concurrent first callers wait on
/// the same load, and a failed load leaves the slot empty for the next caller.
pub struct LazyModel {
    loader: ModelLoader,
    cell: OnceCell<Arc<dyn Classifier>>,
}

impl LazyModel {
    pub fn new(loader: ModelLoader) -> Self {
        Self {
            loader,
            cell: OnceCell::new(),
        }
    }

    pub fn ready(classifier: Arc<dyn Classifier>) -> Self {
        let loader: ModelLoader = {
            let classifier = classifier.clone();
            Arc::new(move || -> Result<Arc<dyn Classifier>, InferenceError> {
                Ok(classifier.clone())
            })
        };
        Self {
            loader,
            cell: OnceCell::new_with(Some(classifier)),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }

    pub async fn get(&self) -> Result<Arc<dyn Classifier>, InferenceError> {
        let classifier = self
            .cell
            .get_or_try_init(|| async {
                let loader = self.loader.clone();
                tokio::task::spawn_blocking(move || loader())
                    .await
                    .map_err(|e| InferenceError::Task(e.to_string()))?
            })
            .await?;
        Ok(classifier.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResult {
    #[serde(serialize_with = "serialize_ordered")]
    pub predictions: Vec<(String, f32)>,
    pub top_disease: String,
    pub confidence: f32,
}

/// Serializes `(key, value)` pairs as a JSON object without reordering them.
pub fn serialize_ordered<K, V, S>(pairs: &[(K, V)], serializer: S) -> Result<S::Ok, S::Error>
where
    K: Serialize,
    V: Serialize,
    S: Serializer,
{
    serializer.collect_map(pairs.iter().map(|(k, v)| (k, v)))
}

/// Inception-v3 preprocessing: RGB, nearest-neighbour resize to 299x299, scale to [-1, 1].
pub fn preprocess(image: &DynamicImage) -> Vec<f32> {
    let rgb = image.to_rgb8();
    let resized = image::imageops::resize(&rgb, INPUT_SIZE, INPUT_SIZE, FilterType::Nearest);

    let mut flat_img = Vec::with_capacity(INPUT_LEN);
    for pixel in resized.pixels() {
        flat_img.push(pixel[0] as f32 / 127.5 - 1.0);
        flat_img.push(pixel[1] as f32 / 127.5 - 1.0);
        flat_img.push(pixel[2] as f32 / 127.5 - 1.0);
    }
    flat_img
}

pub fn predict(
    classifier: &dyn Classifier,
    image_path: &Path,
    class_names: &[String],
) -> Result<PredictionResult, InferenceError> {
    let image = image::open(image_path).map_err(|source| InferenceError::Decode {
        path: image_path.display().to_string(),
        source,
    })?;
    let input = preprocess(&image);

    let scores = classifier.forward(&input)?;
    if scores.len() != class_names.len() || scores.is_empty() {
        return Err(InferenceError::OutputLength {
            expected: class_names.len(),
            got: scores.len(),
        });
    }

    let mut top_idx = 0;
    for (i, &score) in scores.iter().enumerate() {
        if score > scores[top_idx] {
            top_idx = i;
        }
    }

    let predictions: Vec<(String, f32)> = class_names
        .iter()
        .cloned()
        .zip(scores.iter().copied())
        .collect();

    tracing::debug!(
        top_disease = %class_names[top_idx],
        confidence = scores[top_idx],
        "prediction complete"
    );

    Ok(PredictionResult {
        top_disease: class_names[top_idx].clone(),
        confidence: scores[top_idx],
        predictions,
    })
}

#[cfg(feature = "tensorflow")]
pub use self::tf::Model;

#[cfg(feature = "tensorflow")]
mod tf {
    use std::{fs, path::Path, sync::Mutex};

    use tensorflow::{Graph, ImportGraphDefOptions, Session, SessionOptions, SessionRunArgs, Tensor};

    use super::{Classifier, InferenceError, INPUT_SIZE};

    /// Frozen TensorFlow graph executed through a single session.
    pub struct Model {
        inner: Mutex<Inner>,
        input_operation: String,
        output_operation: String,
    }

    struct Inner {
        session: Session,
        graph: Graph,
    }

    impl Model {
        pub fn new(
            model_path: &Path,
            input_operation: &str,
            output_operation: &str,
        ) -> Result<Self, InferenceError> {
            let load_err = |message: String| InferenceError::Load {
                path: model_path.display().to_string(),
                message,
            };

            let model_bytes = fs::read(model_path).map_err(|e| load_err(e.to_string()))?;
            let mut graph = Graph::new();
            graph
                .import_graph_def(&model_bytes, &ImportGraphDefOptions::new())
                .map_err(|e| load_err(e.to_string()))?;

            for name in [input_operation, output_operation] {
                let found = graph
                    .operation_by_name(name)
                    .map_err(|e| load_err(e.to_string()))?;
                if found.is_none() {
                    return Err(load_err(format!("operation '{name}' not found in graph")));
                }
            }

            let session =
                Session::new(&SessionOptions::new(), &graph).map_err(|e| load_err(e.to_string()))?;

            tracing::info!(path = %model_path.display(), "model loaded");

            Ok(Model {
                inner: Mutex::new(Inner { session, graph }),
                input_operation: input_operation.to_string(),
                output_operation: output_operation.to_string(),
            })
        }
    }

    impl Classifier for Model {
        fn forward(&self, input: &[f32]) -> Result<Vec<f32>, InferenceError> {
            let model_err = |e: tensorflow::Status| InferenceError::Model(e.to_string());

            let size = INPUT_SIZE as u64;
            let mut tensor = Tensor::new(&[1, size, size, 3]);
            tensor.copy_from_slice(input);

            let inner = self
                .inner
                .lock()
                .map_err(|_| InferenceError::Model("model lock poisoned".to_string()))?;

            let input_operation = inner
                .graph
                .operation_by_name_required(&self.input_operation)
                .map_err(model_err)?;
            let output_operation = inner
                .graph
                .operation_by_name_required(&self.output_operation)
                .map_err(model_err)?;

            let mut args = SessionRunArgs::new();
            args.add_feed(&input_operation, 0, &tensor);
            let output_token = args.request_fetch(&output_operation, 0);
            inner.session.run(&mut args).map_err(model_err)?;

            let output_tensor: Tensor<f32> = args.fetch(output_token).map_err(model_err)?;
            Ok(output_tensor.to_vec())
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use image::{ImageBuffer, Rgb};

    use super::*;
    use crate::config::DEFAULT_CLASS_NAMES;

    /// Returns a fixed score vector regardless of input.
    pub(crate) struct StubClassifier {
        pub scores: Vec<f32>,
    }

    impl Classifier for StubClassifier {
        fn forward(&self, input: &[f32]) -> Result<Vec<f32>, InferenceError> {
            assert_eq!(input.len(), INPUT_LEN);
            Ok(self.scores.clone())
        }
    }

    pub(crate) fn class_names() -> Vec<String> {
        DEFAULT_CLASS_NAMES.iter().map(|s| s.to_string()).collect()
    }

    fn probability(result: &PredictionResult, label: &str) -> Option<f32> {
        result
            .predictions
            .iter()
            .find(|(name, _)| name == label)
            .map(|(_, p)| *p)
    }

    pub(crate) fn write_png(path: &Path, width: u32, height: u32, value: u8) {
        ImageBuffer::from_pixel(width, height, Rgb([value, value, value]))
            .save(path)
            .unwrap();
    }

    #[test]
    fn preprocess_resizes_and_scales() {
        let white = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(640, 480, Rgb([255, 255, 255])));
        let input = preprocess(&white);
        assert_eq!(input.len(), INPUT_LEN);
        assert!(input.iter().all(|&v| (v - 1.0).abs() < 1e-6));

        let black = DynamicImage::ImageLuma8(ImageBuffer::from_pixel(12, 40, image::Luma([0])));
        let input = preprocess(&black);
        assert_eq!(input.len(), INPUT_LEN);
        assert!(input.iter().all(|&v| (v + 1.0).abs() < 1e-6));
    }

    #[test]
    fn predict_pairs_scores_with_labels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.png");
        write_png(&path, 64, 32, 128);

        let stub = StubClassifier {
            scores: vec![0.01, 0.02, 0.03, 0.70, 0.04, 0.05, 0.06, 0.09],
        };
        let result = predict(&stub, &path, &class_names()).unwrap();

        assert_eq!(result.predictions.len(), 8);
        assert!(result.predictions.iter().all(|(_, p)| (0.0..=1.0).contains(p)));
        assert_eq!(result.top_disease, "DME");
        assert_eq!(probability(&result, &result.top_disease), Some(result.confidence));
        let labels: Vec<&str> = result.predictions.iter().map(|(l, _)| l.as_str()).collect();
        assert_eq!(labels, DEFAULT_CLASS_NAMES);
    }

    #[test]
    fn ties_resolve_to_first_label() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.png");
        write_png(&path, 8, 8, 0);

        let stub = StubClassifier {
            scores: vec![0.1, 0.4, 0.4, 0.0, 0.0, 0.0, 0.0, 0.1],
        };
        let result = predict(&stub, &path, &class_names()).unwrap();
        assert_eq!(result.top_disease, "CNV");
        assert_eq!(result.confidence, 0.4);
    }

    #[test]
    fn output_length_must_match_class_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.png");
        write_png(&path, 8, 8, 0);

        let stub = StubClassifier { scores: vec![0.5, 0.5] };
        let err = predict(&stub, &path, &class_names()).unwrap_err();
        assert!(matches!(err, InferenceError::OutputLength { expected: 8, got: 2 }));
    }

    #[test]
    fn undecodable_image_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.png");
        std::fs::write(&path, b"not an image").unwrap();

        let stub = StubClassifier { scores: vec![0.0; 8] };
        let err = predict(&stub, &path, &class_names()).unwrap_err();
        assert!(matches!(err, InferenceError::Decode { .. }));
    }

    #[test]
    fn predictions_serialize_in_class_order() {
        let result = PredictionResult {
            predictions: vec![("NORMAL".into(), 0.75), ("AMD".into(), 0.25)],
            top_disease: "NORMAL".into(),
            confidence: 0.75,
        };
        let json = serde_json::to_string(&result).unwrap();
        assert_eq!(
            json,
            r#"{"predictions":{"NORMAL":0.75,"AMD":0.25},"top_disease":"NORMAL","confidence":0.75}"#
        );
    }

    #[tokio::test]
    async fn lazy_model_retries_failed_loads_then_caches() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let loader: ModelLoader = {
            let attempts = attempts.clone();
            Arc::new(move || -> Result<Arc<dyn Classifier>, InferenceError> {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(InferenceError::Load {
                        path: "model.pb".into(),
                        message: "corrupt".into(),
                    })
                } else {
                    Ok(Arc::new(StubClassifier { scores: vec![1.0] }))
                }
            })
        };
        let model = LazyModel::new(loader);

        assert!(matches!(model.get().await, Err(InferenceError::Load { .. })));
        assert!(!model.is_loaded());

        model.get().await.unwrap();
        model.get().await.unwrap();
        assert!(model.is_loaded());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_first_callers_share_one_load() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let loader: ModelLoader = {
            let attempts = attempts.clone();
            Arc::new(move || -> Result<Arc<dyn Classifier>, InferenceError> {
                attempts.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(20));
                Ok(Arc::new(StubClassifier { scores: vec![1.0] }))
            })
        };
        let model = Arc::new(LazyModel::new(loader));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let model = model.clone();
                tokio::spawn(async move { model.get().await.map(|_| ()) })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
