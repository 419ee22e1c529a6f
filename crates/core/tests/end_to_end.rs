use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use ndarray::Array3;

use tilescale_core::alpha::{AlphaRescalePath, GpuResampler, GpuResize};
use tilescale_core::resample::resize_bicubic;
use tilescale_core::types::{InferenceResult, OutputFormat, PixelSamples, PlanarTensor};
use tilescale_core::upscaler::{Progress, RunOutcome};
use tilescale_core::{InferenceUnit, Model, ModelProvider, SourceImage, Upscaler};

/// Nearest-neighbour stand-in for a real network: drops the halo and repeats every interior
/// sample `scale` times in both directions. Adds half an 8-bit step so the truncating u8
/// conversion reproduces the source samples.
struct NearestProvider {
    calls: Arc<AtomicUsize>,
    fail_on_call: Option<usize>,
}

impl NearestProvider {
    fn new() -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            fail_on_call: None,
        }
    }

    fn failing_at(call: usize) -> Self {
        Self {
            fail_on_call: Some(call),
            ..Self::new()
        }
    }
}

impl ModelProvider for NearestProvider {
    fn load(&self, model: Model) -> Result<Arc<dyn InferenceUnit>> {
        let geometry = model.geometry();
        let calls = self.calls.clone();
        let fail_on_call = self.fail_on_call;
        Ok(Arc::new(move |input: PlanarTensor| -> Result<InferenceResult> {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            if fail_on_call == Some(call) {
                bail!("device lost on tile {call}");
            }
            let halo = geometry.halo as usize;
            let scale = geometry.scale as usize;
            let side = geometry.out_block_size();
            let out = Array3::from_shape_fn((3, side, side), |(c, y, x)| {
                input.data[[c, halo + y / scale, halo + x / scale]] + 0.5 / 255.0
            });
            Ok(InferenceResult::new(out))
        }))
    }
}

fn rgb_pattern(width: u32, height: u32) -> SourceImage {
    let mut data = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            data.extend_from_slice(&[(x * 3 % 256) as u8, (y * 5 % 256) as u8, ((x + y) % 256) as u8]);
        }
    }
    SourceImage::from_rgb8(width, height, data).expect("valid rgb image")
}

fn expected_rgb(image: &SourceImage, x: u32, y: u32, scale: u32) -> [u8; 3] {
    let PixelSamples::U8(data) = image.samples() else {
        panic!("expected 8-bit source");
    };
    let (sx, sy) = ((x / scale) as usize, (y / scale) as usize);
    let i = image.sample_index(sx, sy, 0);
    [data[i], data[i + 1], data[i + 2]]
}

#[tokio::test]
async fn small_rgb_image_is_padded_and_doubled_exactly() {
    let source = rgb_pattern(64, 64);
    let upscaler = Upscaler::new(Arc::new(NearestProvider::new()));

    let outcome = upscaler
        .run_detailed(&source, Model::AnimeScale2x, |_| {})
        .await
        .expect("run succeeds");
    let RunOutcome::Completed { image, stats } = outcome else {
        panic!("run should complete");
    };

    assert_eq!((image.width, image.height), (128, 128));
    assert_eq!(image.format, OutputFormat::Opaque);
    assert!(stats.padded);
    assert_eq!(stats.tiles, 1);
    assert_eq!(stats.skipped_reads, 0);
    for y in 0..128 {
        for x in 0..128 {
            let [r, g, b, a] = image.pixel(x, y);
            assert_eq!([r, g, b], expected_rgb(&source, x, y, 2), "pixel ({x}, {y})");
            assert_eq!(a, 255);
        }
    }
}

#[tokio::test]
async fn denoise_run_covers_ragged_bottom_edge() {
    let source = rgb_pattern(256, 130);
    let provider = NearestProvider::new();
    let calls = provider.calls.clone();
    let upscaler = Upscaler::new(Arc::new(provider));

    let outcome = upscaler
        .run_detailed(&source, Model::PhotoNoise1, |_| {})
        .await
        .expect("run succeeds");
    let RunOutcome::Completed { image, stats } = outcome else {
        panic!("run should complete");
    };

    assert_eq!((image.width, image.height), (256, 130));
    assert_eq!(stats.tiles, 4);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(stats.output_processed, 4);
    assert!(!stats.padded);
    for (x, y) in [(0, 0), (255, 0), (127, 128), (255, 129), (0, 129), (200, 64)] {
        let [r, g, b, _] = image.pixel(x, y);
        assert_eq!([r, g, b], expected_rgb(&source, x, y, 1), "pixel ({x}, {y})");
    }
}

#[tokio::test]
async fn translucent_rgba_keeps_rescaled_alpha() {
    let (width, height) = (20u32, 12u32);
    let mut data = Vec::with_capacity((width * height * 4) as usize);
    let mut alpha = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            let a = ((x * 12 + y * 4) % 256) as u8;
            data.extend_from_slice(&[40, 80, 120, a]);
            alpha.push(a);
        }
    }
    let source = SourceImage::from_rgba8(width, height, data).expect("valid rgba image");
    let upscaler = Upscaler::new(Arc::new(NearestProvider::new()));

    let outcome = upscaler
        .run_detailed(&source, Model::PhotoNoise2Scale2x, |_| {})
        .await
        .expect("run succeeds");
    let RunOutcome::Completed { image, stats } = outcome else {
        panic!("run should complete");
    };

    assert_eq!(image.format, OutputFormat::Straight);
    assert_eq!(
        stats.alpha_path.map(|p| p.to_string()),
        Some("cpu".to_string())
    );
    let expected_alpha = resize_bicubic(&alpha, 1, width as usize, height as usize, 2.0);
    let actual_alpha: Vec<u8> = image.data.chunks_exact(4).map(|px| px[3]).collect();
    assert_eq!(actual_alpha, expected_alpha);
    assert!(image
        .data
        .chunks_exact(4)
        .all(|px| px[..3] == [40, 80, 120]));
}

/// Device resampler that repeats every alpha sample `scale` times.
struct NearestGpu {
    calls: Arc<AtomicUsize>,
}

impl GpuResampler for NearestGpu {
    fn max_supported_dimension(&self) -> u32 {
        4096
    }

    fn resize_single_channel(&self, mask: &[u8], width: u32, height: u32, scale: u32) -> GpuResize {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (w, s) = (width as usize, scale as usize);
        let out_w = w * s;
        let data = (0..height as usize * s * out_w)
            .map(|i| mask[(i / out_w / s) * w + (i % out_w) / s])
            .collect();
        GpuResize::Resized(data)
    }
}

#[tokio::test]
async fn translucent_rgba_prefers_gpu_resampler() {
    let (width, height) = (10u32, 6u32);
    let data: Vec<u8> = (0..width * height)
        .flat_map(|i| [200, 100, 50, (i * 4) as u8])
        .collect();
    let source = SourceImage::from_rgba8(width, height, data).expect("valid rgba image");
    let gpu_calls = Arc::new(AtomicUsize::new(0));
    let upscaler = Upscaler::new(Arc::new(NearestProvider::new())).with_gpu_resampler(Arc::new(
        NearestGpu {
            calls: gpu_calls.clone(),
        },
    ));

    let outcome = upscaler
        .run_detailed(&source, Model::AnimeNoise0Scale2x, |_| {})
        .await
        .expect("run succeeds");
    let RunOutcome::Completed { image, stats } = outcome else {
        panic!("run should complete");
    };

    assert_eq!(stats.alpha_path, Some(AlphaRescalePath::Gpu));
    assert_eq!(gpu_calls.load(Ordering::SeqCst), 1);
    assert_eq!(image.format, OutputFormat::Straight);
    assert_eq!((image.width, image.height), (20, 12));
    for (x, y) in [(0, 0), (19, 0), (7, 11), (19, 11)] {
        let expected = ((y / 2 * width + x / 2) * 4) as u8;
        assert_eq!(image.pixel(x, y), [200, 100, 50, expected], "pixel ({x}, {y})");
    }
}

#[tokio::test]
async fn opaque_rgba_is_reported_without_alpha() {
    let source = SourceImage::from_rgba8(8, 8, [10, 20, 30, 255].repeat(64)).expect("image");
    let upscaler = Upscaler::new(Arc::new(NearestProvider::new()));
    let image = upscaler
        .run(&source, Model::AnimeNoise0, |_| {})
        .await
        .expect("result");
    assert_eq!(image.format, OutputFormat::Opaque);
    assert!(!image.has_alpha());
}

#[tokio::test]
async fn sixteen_bit_input_is_quantised_to_eight_bits() {
    let samples: Vec<u16> = (0..16u16 * 16 * 3).map(|i| (i % 256) * 257).collect();
    let source = SourceImage::new(16, 16, 3, PixelSamples::U16(samples.clone())).expect("image");
    let upscaler = Upscaler::new(Arc::new(NearestProvider::new()));

    let image = upscaler
        .run(&source, Model::AnimeNoise2, |_| {})
        .await
        .expect("result");
    let rgb = image.to_rgb8();
    let expected: Vec<u8> = samples.iter().map(|v| (v / 257) as u8).collect();
    assert_eq!(rgb, expected);
}

#[tokio::test]
async fn progress_milestones_arrive_in_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let upscaler = Upscaler::new(Arc::new(NearestProvider::new()));

    upscaler
        .run(&rgb_pattern(300, 300), Model::AnimeNoise3, move |p| {
            sink.lock().expect("progress lock").push(p)
        })
        .await
        .expect("result");

    let seen = seen.lock().expect("progress lock").clone();
    assert_eq!(seen.first(), Some(&Progress::Processing));
    assert_eq!(seen.last(), Some(&Progress::Finished));

    let percents: Vec<u32> = seen
        .iter()
        .filter_map(|p| match p {
            Progress::Percent(v) => Some(*v),
            _ => None,
        })
        .collect();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(percents.last(), Some(&100));

    let tail: Vec<&Progress> = seen
        .iter()
        .filter(|p| !matches!(p, Progress::Percent(_)))
        .collect();
    assert_eq!(
        tail,
        vec![
            &Progress::Processing,
            &Progress::WaitAlpha,
            &Progress::GenerateOutput,
            &Progress::Finished
        ]
    );
}

#[tokio::test]
async fn interrupt_during_run_discards_output() {
    let upscaler = Arc::new(Upscaler::new(Arc::new(NearestProvider::new())));
    let flag = upscaler.interrupt_flag();

    let outcome = upscaler
        .run_detailed(&rgb_pattern(400, 300), Model::PhotoNoise0, move |p| {
            if matches!(p, Progress::Percent(v) if v >= 50) {
                flag.interrupt();
            }
        })
        .await
        .expect("interrupt is not an error");
    assert!(matches!(outcome, RunOutcome::Interrupted));

    let flag = upscaler.interrupt_flag();
    let none = upscaler
        .run(&rgb_pattern(200, 200), Model::PhotoNoise0, move |p| {
            if p == Progress::WaitAlpha {
                flag.interrupt();
            }
        })
        .await;
    assert!(none.is_none());
}

#[tokio::test]
async fn inference_failure_yields_no_result() {
    let upscaler = Upscaler::new(Arc::new(NearestProvider::failing_at(2)));
    let source = rgb_pattern(400, 300);

    let err = upscaler
        .run_detailed(&source, Model::AnimeNoise1, |_| {})
        .await
        .expect_err("run should fail");
    assert!(format!("{err:#}").contains("device lost"));

    let upscaler = Upscaler::new(Arc::new(NearestProvider::failing_at(0)));
    assert!(upscaler
        .run(&source, Model::AnimeNoise1, |_| {})
        .await
        .is_none());
}

#[tokio::test]
async fn wrongly_shaped_result_is_fatal() {
    struct Shrinking;
    impl ModelProvider for Shrinking {
        fn load(&self, _model: Model) -> Result<Arc<dyn InferenceUnit>> {
            Ok(Arc::new(|_: PlanarTensor| -> Result<InferenceResult> {
                Ok(InferenceResult::new(Array3::zeros((3, 10, 10))))
            }))
        }
    }

    let upscaler = Upscaler::new(Arc::new(Shrinking));
    assert!(upscaler
        .run(&rgb_pattern(32, 32), Model::PhotoScale2x, |_| {})
        .await
        .is_none());
}
