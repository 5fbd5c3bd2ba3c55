//! End-to-end pipeline behaviour on a small random model

use std::io::Cursor;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use burn::backend::Autodiff;
use burn::tensor::Tensor;
use burn_ndarray::NdArray;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

use cardamom_cam::inference::{InferencePipeline, PipelineConfig, PipelineOutput, PipelineStage};
use cardamom_cam::model::{
    BurnModelProvider, HookRegistry, LayerNode, ModelConfig, ModelProvider,
};
use cardamom_cam::{CardamomError, CLASS_NAMES};

type TestBackend = Autodiff<NdArray>;
type Inner = NdArray;

fn provider() -> BurnModelProvider<TestBackend> {
    BurnModelProvider::random(&ModelConfig::tiny(), &Default::default()).unwrap()
}

fn pipeline_for(provider: Arc<dyn ModelProvider<TestBackend>>) -> InferencePipeline<TestBackend> {
    InferencePipeline::new(provider, PipelineConfig::default()).unwrap()
}

fn solid(width: u32, height: u32, color: [u8; 3]) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(color)))
}

fn gradient_image(seed: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(64, 48, move |x, y| {
        Rgb([
            ((x * 4 + seed * 40) % 256) as u8,
            ((y * 5 + seed * 70) % 256) as u8,
            ((x + y + seed * 25) % 256) as u8,
        ])
    }))
}

fn png_bytes(image: &DynamicImage) -> Vec<u8> {
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png).unwrap();
    buffer.into_inner()
}

fn assert_same_output(a: &PipelineOutput, b: &PipelineOutput) {
    assert_eq!(a.prediction.class_name, b.prediction.class_name);
    assert_eq!(a.prediction.confidence, b.prediction.confidence);
    assert_eq!(a.target_class, b.target_class);
    assert_eq!(a.saliency.values().len(), b.saliency.values().len());
    for (x, y) in a.saliency.values().iter().zip(b.saliency.values()) {
        assert!((x - y).abs() < 1e-5, "saliency differs: {} vs {}", x, y);
    }
}

/// How a wrapped provider misbehaves during the observed pass
#[derive(Clone, Copy)]
enum Fault {
    /// Returns an error after the forward pass has run
    Error,
    /// Returns logits with no history leading back to the model
    DetachedLogits,
    /// Panics after the forward pass has run
    Panic,
    /// Fails once the explained class is chosen, before the backward pass
    BeforeBackward,
}

struct FaultyProvider {
    inner: BurnModelProvider<TestBackend>,
    fault: Fault,
    /// Class handed to `before_backward`, if it was reached
    seen_class: Mutex<Option<usize>>,
}

impl FaultyProvider {
    fn new(fault: Fault) -> Self {
        Self {
            inner: provider(),
            fault,
            seen_class: Mutex::new(None),
        }
    }
}

impl ModelProvider<TestBackend> for FaultyProvider {
    fn score(&self, input: Tensor<Inner, 4>) -> cardamom_cam::Result<Tensor<Inner, 2>> {
        self.inner.score(input)
    }

    fn layers(&self) -> LayerNode {
        self.inner.layers()
    }

    fn is_trained(&self) -> bool {
        self.inner.is_trained()
    }

    fn class_names(&self) -> &[String] {
        self.inner.class_names()
    }

    fn hooks(&self) -> &HookRegistry<TestBackend> {
        self.inner.hooks()
    }

    fn forward_observed(
        &self,
        input: Tensor<TestBackend, 4>,
    ) -> cardamom_cam::Result<Tensor<TestBackend, 2>> {
        let logits = self.inner.forward_observed(input)?;
        match self.fault {
            Fault::Error => Err(CardamomError::Inference("injected failure".to_string())),
            Fault::DetachedLogits => Ok(logits.detach().require_grad()),
            Fault::Panic => panic!("injected panic"),
            Fault::BeforeBackward => Ok(logits),
        }
    }

    fn before_backward(&self, target_class: usize) -> cardamom_cam::Result<()> {
        *self.seen_class.lock().unwrap() = Some(target_class);
        match self.fault {
            Fault::BeforeBackward => Err(CardamomError::Inference(
                "injected failure before backward".to_string(),
            )),
            _ => Ok(()),
        }
    }

    fn device(&self) -> <TestBackend as burn::tensor::backend::Backend>::Device {
        self.inner.device()
    }
}

#[test]
fn green_image_end_to_end() {
    let pipeline = pipeline_for(Arc::new(provider()));
    let bytes = png_bytes(&solid(256, 256, [0, 200, 0]));

    let response = pipeline.run_bytes(Some("image/png"), &bytes).unwrap();

    assert!(CLASS_NAMES.contains(&response.class_name.as_str()));
    assert!((0.0..=1.0).contains(&response.confidence));
    assert!(!response.model_trained);
    assert!(response.warning.is_some());

    let png = STANDARD.decode(&response.heatmap).unwrap();
    let heatmap = image::load_from_memory_with_format(&png, ImageFormat::Png).unwrap();
    assert_eq!((heatmap.width(), heatmap.height()), (256, 256));
}

#[test]
fn overlay_matches_upload_resolution() {
    let pipeline = pipeline_for(Arc::new(provider()));

    let output = pipeline.run_detailed(&gradient_image(1), None).unwrap();
    let overlay = image::load_from_memory_with_format(&output.overlay_png, ImageFormat::Png).unwrap();

    assert_eq!((overlay.width(), overlay.height()), (64, 48));
    // 224 input, three pools before the last convolution
    assert_eq!((output.saliency.width(), output.saliency.height()), (28, 28));
    assert!(output.saliency.values().iter().all(|v| (0.0..=1.0).contains(v)));
}

#[test]
fn text_upload_never_reaches_the_model() {
    let pipeline = pipeline_for(Arc::new(provider()));

    let err = pipeline
        .run_bytes(Some("text/plain"), b"just some notes")
        .unwrap_err();

    assert_eq!(err.stage, PipelineStage::Idle);
    assert!(matches!(err.source, CardamomError::InvalidImage(_)));
    assert!(err.public_detail().starts_with("File must be an image"));
}

#[test]
fn repeated_runs_are_identical() {
    let pipeline = pipeline_for(Arc::new(provider()));
    let image = gradient_image(3);

    let first = pipeline.run_detailed(&image, None).unwrap();
    let second = pipeline.run_detailed(&image, None).unwrap();

    assert_same_output(&first, &second);
    assert_eq!(
        pipeline.run_image(&image).unwrap(),
        pipeline.run_image(&image).unwrap()
    );
}

#[test]
fn concurrent_requests_do_not_mix() {
    let pipeline = pipeline_for(Arc::new(provider()));
    let images: Vec<DynamicImage> = (0..6).map(gradient_image).collect();

    // explain a different class per image so a mix-up is visible
    let baseline: Vec<PipelineOutput> = images
        .iter()
        .enumerate()
        .map(|(i, image)| pipeline.run_detailed(image, Some(i % 3)).unwrap())
        .collect();

    let concurrent: Vec<PipelineOutput> = std::thread::scope(|scope| {
        let handles: Vec<_> = images
            .iter()
            .enumerate()
            .map(|(i, image)| {
                let pipeline = &pipeline;
                scope.spawn(move || pipeline.run_detailed(image, Some(i % 3)).unwrap())
            })
            .collect();

        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for (expected, actual) in baseline.iter().zip(&concurrent) {
        assert_same_output(expected, actual);
    }
    assert_eq!(pipeline.provider().hooks().active_observers(), 0);
}

#[test]
fn invalid_target_class_releases_observers() {
    let pipeline = pipeline_for(Arc::new(provider()));
    let image = gradient_image(2);
    let baseline = pipeline.run_detailed(&image, None).unwrap();

    let err = pipeline.run_detailed(&gradient_image(4), Some(17)).unwrap_err();
    assert!(matches!(err.source, CardamomError::InvalidTargetClass { .. }));
    assert_eq!(pipeline.provider().hooks().active_observers(), 0);

    let fresh = pipeline.run_detailed(&image, None).unwrap();
    assert_same_output(&baseline, &fresh);
}

#[test]
fn failing_observed_pass_releases_observers() {
    for fault in [Fault::Error, Fault::DetachedLogits] {
        let faulty = Arc::new(FaultyProvider::new(fault));
        let pipeline = pipeline_for(faulty.clone());

        let err = pipeline.run_detailed(&gradient_image(5), None).unwrap_err();
        assert_eq!(err.stage, PipelineStage::LayerLocated);
        assert_eq!(faulty.hooks().active_observers(), 0);

        // the same model still explains correctly through a healthy pipeline
        let healthy = pipeline_for(Arc::new(FaultlessView(faulty.clone())));
        assert!(healthy.run_detailed(&gradient_image(6), None).is_ok());
    }
}

#[test]
fn detached_logits_are_a_gradient_failure() {
    let pipeline = pipeline_for(Arc::new(FaultyProvider::new(Fault::DetachedLogits)));

    let err = pipeline.run_detailed(&gradient_image(0), None).unwrap_err();
    assert!(matches!(err.source, CardamomError::GradientComputationFailed(_)));
    assert_eq!(
        err.public_detail(),
        "Could not compute the explanation heatmap"
    );
}

#[test]
fn panic_mid_pass_releases_observers() {
    let faulty = Arc::new(FaultyProvider::new(Fault::Panic));
    let pipeline = pipeline_for(faulty.clone());

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let _ = pipeline.run_detailed(&gradient_image(7), None);
    }));
    assert!(result.is_err());
    assert_eq!(faulty.hooks().active_observers(), 0);

    // the session lock is usable again
    let healthy = pipeline_for(Arc::new(FaultlessView(faulty.clone())));
    assert!(healthy.run_detailed(&gradient_image(8), None).is_ok());
}

#[test]
fn failure_after_class_selection_leaves_no_trace() {
    let faulty = Arc::new(FaultyProvider::new(Fault::BeforeBackward));
    let healthy = pipeline_for(Arc::new(FaultlessView(faulty.clone())));
    let image = gradient_image(9);
    let baseline = healthy.run_detailed(&image, Some(1)).unwrap();

    let pipeline = pipeline_for(faulty.clone());
    let err = pipeline.run_detailed(&gradient_image(10), Some(2)).unwrap_err();

    assert_eq!(err.stage, PipelineStage::LayerLocated);
    assert!(matches!(err.source, CardamomError::Inference(_)));
    assert_eq!(err.public_detail(), "Error processing image");
    // the class had been chosen when the pass was abandoned
    assert_eq!(*faulty.seen_class.lock().unwrap(), Some(2));
    assert_eq!(faulty.hooks().active_observers(), 0);

    // an unrelated request afterwards sees only its own snapshots
    let fresh = healthy.run_detailed(&image, Some(1)).unwrap();
    assert_same_output(&baseline, &fresh);
    assert_eq!(faulty.hooks().active_observers(), 0);
}

#[test]
fn trained_weights_drop_the_warning() {
    let dir = tempfile::tempdir().unwrap();
    let weights = dir.path().join("cardamom_model");
    provider().save_weights(&weights).unwrap();

    let loaded = BurnModelProvider::<TestBackend>::load(
        &ModelConfig::tiny(),
        Some(weights.as_path()),
        &Default::default(),
    )
    .unwrap();
    let pipeline = pipeline_for(Arc::new(loaded));

    let response = pipeline.run_image(&solid(100, 80, [120, 90, 30])).unwrap();
    assert!(response.model_trained);
    assert!(response.warning.is_none());
}

/// The inner model of a [`FaultyProvider`], without the fault
struct FaultlessView(Arc<FaultyProvider>);

impl ModelProvider<TestBackend> for FaultlessView {
    fn score(&self, input: Tensor<Inner, 4>) -> cardamom_cam::Result<Tensor<Inner, 2>> {
        self.0.inner.score(input)
    }

    fn layers(&self) -> LayerNode {
        self.0.inner.layers()
    }

    fn is_trained(&self) -> bool {
        self.0.inner.is_trained()
    }

    fn class_names(&self) -> &[String] {
        self.0.inner.class_names()
    }

    fn hooks(&self) -> &HookRegistry<TestBackend> {
        self.0.inner.hooks()
    }

    fn forward_observed(
        &self,
        input: Tensor<TestBackend, 4>,
    ) -> cardamom_cam::Result<Tensor<TestBackend, 2>> {
        self.0.inner.forward_observed(input)
    }

    fn device(&self) -> <TestBackend as burn::tensor::backend::Backend>::Device {
        self.0.inner.device()
    }
}
