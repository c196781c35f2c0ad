//! Image normalization run before every submission
//!
//! Strictly ordered pipeline:
//! 1. **Format normalization** - camera containers (HEIC/HEIF) and formats the
//!    engines do not accept are converted to JPEG at the configured quality.
//!    Container decoders already apply embedded orientation, so step 2 is
//!    skipped for anything converted here.
//! 2. **Metadata orientation** - EXIF quarter/half turns are applied to the
//!    raster.
//! 3. **Content orientation** - only while the remote service is reachable:
//!    the classifier's detected angle `d` becomes a `(360 - d) % 360`
//!    correction, applied when its confidence exceeds the threshold.
//!
//! Every step degrades to "best image so far"; [`Preprocessor::process`]
//! cannot fail.

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use crate::config::PreprocessConfig;
use crate::error::{ClientError, Result};
use crate::event_sink::{EventSink, LogCategory};

/// Formats both recognition engines consume directly.
const ACCEPTED_FORMATS: &[ImageFormat] = &[
    ImageFormat::Png,
    ImageFormat::Jpeg,
    ImageFormat::Gif,
    ImageFormat::Bmp,
    ImageFormat::WebP,
    ImageFormat::Tiff,
];

const HEIF_BRANDS: &[&[u8; 4]] = &[
    b"heic", b"heix", b"hevc", b"hevx", b"heim", b"heis", b"mif1", b"msf1",
];

/// A user-selected file, before normalization.
#[derive(Debug, Clone)]
pub struct InputFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl InputFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }

    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        Ok(Self { name, bytes })
    }

    fn extension(&self) -> Option<String> {
        Path::new(&self.name)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
    }
}

/// The image actually sent to an engine.
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedImage {
    pub file_name: String,
    pub mime: String,
    #[serde(skip)]
    pub bytes: Vec<u8>,
    /// Zero when the input could not be decoded locally
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationSource {
    Exif,
    ContentDetection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transformation {
    FormatConverted { from: String, to: String },
    Rotated { degrees: u32, source: RotationSource },
}

#[derive(Debug, Clone)]
pub struct PreprocessResult {
    pub image: NormalizedImage,
    pub transformations: Vec<Transformation>,
}

impl PreprocessResult {
    pub fn format_converted(&self) -> bool {
        self.transformations
            .iter()
            .any(|t| matches!(t, Transformation::FormatConverted { .. }))
    }

    /// Net clockwise rotation applied, in degrees.
    pub fn rotation_degrees(&self) -> u32 {
        self.transformations
            .iter()
            .filter_map(|t| match t {
                Transformation::Rotated { degrees, .. } => Some(*degrees),
                _ => None,
            })
            .sum::<u32>()
            % 360
    }

    pub fn rotation_sources(&self) -> Vec<RotationSource> {
        self.transformations
            .iter()
            .filter_map(|t| match t {
                Transformation::Rotated { source, .. } => Some(*source),
                _ => None,
            })
            .collect()
    }
}

/// Decoder for camera container formats the `image` crate cannot read.
/// Implementations must return the raster with embedded orientation applied.
pub trait ContainerDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrientationEstimate {
    /// Detected orientation of the content, clockwise degrees
    pub angle: i32,
    pub confidence: f64,
}

/// Content-orientation classifier (the remote service in production).
#[async_trait]
pub trait OrientationDetector: Send + Sync {
    async fn detect(&self, png: &[u8]) -> Result<OrientationEstimate>;
}

/// Rotate clockwise by a right angle. Quarter turns swap width and height;
/// any other angle returns the image unchanged.
pub fn rotate_image(image: &DynamicImage, degrees: u32) -> DynamicImage {
    match degrees % 360 {
        90 => image.rotate90(),
        180 => image.rotate180(),
        270 => image.rotate270(),
        _ => image.clone(),
    }
}

/// Clockwise correction for a detected content angle.
pub fn correction_angle(detected: i32) -> u32 {
    let detected = detected.rem_euclid(360) as u32;
    (360 - detected) % 360
}

/// Right-angle rotation encoded by EXIF orientation; `None` for identity and
/// mirror transforms.
pub fn exif_rotation(orientation: Orientation) -> Option<u32> {
    match orientation {
        Orientation::Rotate90 => Some(90),
        Orientation::Rotate180 => Some(180),
        Orientation::Rotate270 => Some(270),
        _ => None,
    }
}

pub fn is_heif(bytes: &[u8], extension: Option<&str>) -> bool {
    let brand_match = bytes.len() >= 12
        && &bytes[4..8] == b"ftyp"
        && HEIF_BRANDS.iter().any(|b| &bytes[8..12] == *b);
    brand_match || matches!(extension, Some("heic") | Some("heif"))
}

enum SourceKind {
    Accepted(ImageFormat),
    Container,
    Convertible(ImageFormat),
    Unknown,
}

fn classify(file: &InputFile) -> SourceKind {
    let extension = file.extension();
    if is_heif(&file.bytes, extension.as_deref()) {
        return SourceKind::Container;
    }
    match image::guess_format(&file.bytes) {
        Ok(format) if ACCEPTED_FORMATS.contains(&format) => SourceKind::Accepted(format),
        Ok(format) => SourceKind::Convertible(format),
        Err(_) => SourceKind::Unknown,
    }
}

fn format_label(format: ImageFormat) -> String {
    format
        .extensions_str()
        .first()
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("{:?}", format).to_lowercase())
}

fn with_extension(name: &str, extension: &str) -> String {
    let stem = Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());
    format!("{}.{}", stem, extension)
}

pub fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buffer, quality))?;
    Ok(buffer)
}

pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    image.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)?;
    Ok(buffer)
}

/// Run CPU-bound image work on the blocking pool.
async fn off_runtime<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ClientError::Preprocess(format!("image task failed: {}", e)))?
}

type DecodedImage = (DynamicImage, std::result::Result<Orientation, String>);

/// Decode an accepted format and read its orientation tag. A failure to read
/// the tag is reported separately from a failure to decode pixels.
fn decode_with_orientation(bytes: &[u8]) -> Result<DecodedImage> {
    let mut decoder = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .into_decoder()?;
    let orientation = decoder.orientation().map_err(|e| e.to_string());
    let image = DynamicImage::from_decoder(decoder)?;
    Ok((image, orientation))
}

/// Intermediate state threaded through the pipeline steps.
struct Working {
    file: Arc<InputFile>,
    image: Option<Arc<DynamicImage>>,
    output_format: Option<ImageFormat>,
    dirty: bool,
    transformations: Vec<Transformation>,
}

impl Working {
    fn passthrough(file: Arc<InputFile>) -> Self {
        Self {
            file,
            image: None,
            output_format: None,
            dirty: false,
            transformations: Vec::new(),
        }
    }
}

pub struct Preprocessor {
    config: PreprocessConfig,
    sink: Arc<EventSink>,
    container_decoder: Option<Arc<dyn ContainerDecoder>>,
    orientation_detector: Option<Arc<dyn OrientationDetector>>,
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig, sink: Arc<EventSink>) -> Self {
        Self {
            config,
            sink,
            container_decoder: None,
            orientation_detector: None,
        }
    }

    pub fn with_container_decoder(mut self, decoder: Arc<dyn ContainerDecoder>) -> Self {
        self.container_decoder = Some(decoder);
        self
    }

    pub fn with_orientation_detector(mut self, detector: Arc<dyn OrientationDetector>) -> Self {
        self.orientation_detector = Some(detector);
        self
    }

    /// Normalize `file`. Content-orientation detection runs only when
    /// `remote_reachable` is set.
    pub async fn process(&self, file: InputFile, remote_reachable: bool) -> PreprocessResult {
        let file = Arc::new(file);
        self.sink.info(
            LogCategory::Recognition,
            format!("Preprocessing {} ({} bytes)", file.name, file.bytes.len()),
        );

        let decode_input = file.clone();
        let sink = self.sink.clone();
        let quality = self.config.jpeg_quality;
        let decoder = self.container_decoder.clone();

        let mut working = match tokio::task::spawn_blocking(move || {
            normalize_raster(decode_input, quality, decoder.as_deref(), &sink)
        })
        .await
        {
            Ok(working) => working,
            Err(e) => {
                self.sink.warn(
                    LogCategory::Recognition,
                    format!("Image normalization aborted: {}; submitting original file", e),
                );
                Working::passthrough(file.clone())
            }
        };

        self.correct_content_orientation(&mut working, remote_reachable).await;
        self.finish(working).await
    }

    async fn correct_content_orientation(&self, working: &mut Working, remote_reachable: bool) {
        if !self.config.detect_orientation {
            return;
        }
        let Some(detector) = self.orientation_detector.as_ref() else {
            return;
        };
        if !remote_reachable {
            self.sink.info(
                LogCategory::Recognition,
                "Remote service unreachable; skipping orientation detection",
            );
            return;
        }
        let Some(image) = working.image.clone() else {
            self.sink.warn(
                LogCategory::Recognition,
                "Image could not be decoded locally; skipping orientation detection",
            );
            return;
        };

        let source = image.clone();
        let png = match off_runtime(move || encode_png(&source)).await {
            Ok(png) => png,
            Err(e) => {
                self.sink.warn(
                    LogCategory::Recognition,
                    format!("Could not encode image for orientation detection: {}", e),
                );
                return;
            }
        };

        let estimate = match detector.detect(&png).await {
            Ok(estimate) => estimate,
            Err(e) => {
                self.sink.warn(
                    LogCategory::Recognition,
                    format!("Orientation detection failed: {}; keeping image as-is", e),
                );
                return;
            }
        };

        if estimate.angle.rem_euclid(90) != 0 {
            self.sink.warn(
                LogCategory::Recognition,
                format!("Ignoring unsupported detected angle {}°", estimate.angle),
            );
            return;
        }

        let correction = correction_angle(estimate.angle);
        if correction == 0 || estimate.confidence <= self.config.orientation_min_confidence {
            self.sink.warn(
                LogCategory::Recognition,
                format!(
                    "Orientation: no correction needed or low confidence \
                     (detected {}°, confidence {:.2})",
                    estimate.angle,
                    estimate.confidence
                ),
            );
            return;
        }

        let rotated = match off_runtime(move || Ok(rotate_image(&image, correction))).await {
            Ok(rotated) => rotated,
            Err(e) => {
                self.sink.warn(
                    LogCategory::Recognition,
                    format!("Orientation correction failed: {}; keeping image as-is", e),
                );
                return;
            }
        };
        working.image = Some(Arc::new(rotated));
        working.dirty = true;
        working.transformations.push(Transformation::Rotated {
            degrees: correction,
            source: RotationSource::ContentDetection,
        });
        self.sink.success(
            LogCategory::Recognition,
            format!(
                "Rotated {}° to correct detected orientation (detected {}°, confidence {:.2})",
                correction,
                estimate.angle,
                estimate.confidence
            ),
        );
    }

    async fn finish(&self, working: Working) -> PreprocessResult {
        let Working {
            file,
            image,
            output_format,
            dirty,
            transformations,
        } = working;

        let (width, height) = image
            .as_ref()
            .map(|i| (i.width(), i.height()))
            .unwrap_or((0, 0));

        let original = || {
            let mime = image::guess_format(&file.bytes)
                .map(|f| f.to_mime_type().to_string())
                .unwrap_or_else(|_| mime_for_extension(file.extension().as_deref()));
            NormalizedImage {
                file_name: file.name.clone(),
                mime,
                bytes: file.bytes.clone(),
                width,
                height,
            }
        };

        let (Some(image), Some(format), true) = (image, output_format, dirty) else {
            return PreprocessResult {
                image: original(),
                transformations,
            };
        };

        let quality = self.config.jpeg_quality;
        let encoded = off_runtime(move || match format {
            ImageFormat::Jpeg => encode_jpeg(&image, quality).map(|b| (b, ImageFormat::Jpeg)),
            _ => encode_png(&image).map(|b| (b, ImageFormat::Png)),
        })
        .await;

        match encoded {
            Ok((bytes, format)) => {
                self.sink.debug(
                    LogCategory::Recognition,
                    format!(
                        "Encoded normalized image as {} ({} bytes)",
                        format_label(format),
                        bytes.len()
                    ),
                );
                PreprocessResult {
                    image: NormalizedImage {
                        file_name: with_extension(&file.name, &format_label(format)),
                        mime: format.to_mime_type().to_string(),
                        bytes,
                        width,
                        height,
                    },
                    transformations,
                }
            }
            Err(e) => {
                self.sink.warn(
                    LogCategory::Recognition,
                    format!(
                        "Could not encode normalized image: {}; submitting original file",
                        e
                    ),
                );
                PreprocessResult {
                    image: original(),
                    transformations: Vec::new(),
                }
            }
        }
    }
}

fn mime_for_extension(extension: Option<&str>) -> String {
    match extension {
        Some("heic") => "image/heic",
        Some("heif") => "image/heif",
        _ => "application/octet-stream",
    }
    .to_string()
}

/// Steps 1 and 2. Runs on the blocking pool.
fn normalize_raster(
    file: Arc<InputFile>,
    quality: u8,
    container_decoder: Option<&dyn ContainerDecoder>,
    sink: &EventSink,
) -> Working {
    let mut working = Working::passthrough(file.clone());

    match classify(&file) {
        SourceKind::Container => {
            let from = file.extension().unwrap_or_else(|| "heic".to_string());
            let decoded = match container_decoder {
                Some(decoder) => decoder.decode(&file.bytes),
                None => Err(ClientError::Preprocess(
                    "no decoder configured for camera container formats".to_string(),
                )),
            };
            match decoded {
                Ok(image) => {
                    working.image = Some(Arc::new(image));
                    working.output_format = Some(ImageFormat::Jpeg);
                    working.dirty = true;
                    working.transformations.push(Transformation::FormatConverted {
                        from: from.clone(),
                        to: "jpg".to_string(),
                    });
                    sink.success(
                        LogCategory::Recognition,
                        format!(
                            "Converted {} to JPEG ({}% quality)",
                            from.to_uppercase(),
                            quality
                        ),
                    );
                }
                Err(e) => {
                    sink.warn(
                        LogCategory::Recognition,
                        format!(
                            "{} conversion failed: {}; submitting original file",
                            from.to_uppercase(),
                            e
                        ),
                    );
                }
            }
        }
        SourceKind::Convertible(format) => match image::load_from_memory_with_format(
            &file.bytes,
            format,
        ) {
            Ok(image) => {
                working.image = Some(Arc::new(image));
                working.output_format = Some(ImageFormat::Jpeg);
                working.dirty = true;
                working.transformations.push(Transformation::FormatConverted {
                    from: format_label(format),
                    to: "jpg".to_string(),
                });
                sink.success(
                    LogCategory::Recognition,
                    format!(
                        "Converted {} to JPEG ({}% quality)",
                        format_label(format).to_uppercase(),
                        quality
                    ),
                );
            }
            Err(e) => {
                sink.warn(
                    LogCategory::Recognition,
                    format!(
                        "Could not decode {} image: {}; submitting original file",
                        format_label(format),
                        e
                    ),
                );
            }
        },
        SourceKind::Accepted(format) => match decode_with_orientation(&file.bytes) {
            Ok((image, orientation)) => {
                working.output_format = Some(format);
                let image = match orientation {
                    Ok(orientation) => match exif_rotation(orientation) {
                        Some(degrees) => {
                            working.dirty = true;
                            working.transformations.push(Transformation::Rotated {
                                degrees,
                                source: RotationSource::Exif,
                            });
                            sink.success(
                                LogCategory::Recognition,
                                format!("Applied EXIF orientation: rotated {}°", degrees),
                            );
                            rotate_image(&image, degrees)
                        }
                        None => {
                            if orientation != Orientation::NoTransforms {
                                sink.debug(
                                    LogCategory::Recognition,
                                    format!("Ignoring mirrored EXIF orientation {:?}", orientation),
                                );
                            }
                            image
                        }
                    },
                    Err(e) => {
                        sink.warn(
                            LogCategory::Recognition,
                            format!(
                                "Could not read orientation metadata: {}; continuing unrotated",
                                e
                            ),
                        );
                        image
                    }
                };
                working.image = Some(Arc::new(image));
            }
            Err(e) => {
                sink.warn(
                    LogCategory::Recognition,
                    format!("Could not decode image: {}; submitting original file", e),
                );
            }
        },
        SourceKind::Unknown => {
            sink.warn(
                LogCategory::Recognition,
                format!("Unrecognised image format for {}; submitting as-is", file.name),
            );
        }
    }

    working
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sink::{LogFilter, LogLevel};
    use image::{Rgb, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let pixels = RgbImage::from_pixel(width, height, Rgb([200, 10, 10]));
        let image = DynamicImage::ImageRgb8(pixels);
        encode_png(&image).unwrap()
    }

    struct FixedDetector {
        estimate: OrientationEstimate,
        calls: AtomicUsize,
    }

    impl FixedDetector {
        fn new(angle: i32, confidence: f64) -> Arc<Self> {
            Arc::new(Self {
                estimate: OrientationEstimate { angle, confidence },
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl OrientationDetector for FixedDetector {
        async fn detect(&self, png: &[u8]) -> Result<OrientationEstimate> {
            assert!(image::guess_format(png).unwrap() == ImageFormat::Png);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.estimate)
        }
    }

    struct FailingDetector;

    #[async_trait]
    impl OrientationDetector for FailingDetector {
        async fn detect(&self, _png: &[u8]) -> Result<OrientationEstimate> {
            Err(ClientError::Network("connection reset".into()))
        }
    }

    struct SolidDecoder;

    impl ContainerDecoder for SolidDecoder {
        fn decode(&self, _bytes: &[u8]) -> Result<DynamicImage> {
            Ok(DynamicImage::ImageRgb8(RgbImage::new(8, 4)))
        }
    }

    fn heic_bytes() -> Vec<u8> {
        let mut bytes = vec![0, 0, 0, 24];
        bytes.extend_from_slice(b"ftypheic");
        bytes.extend_from_slice(&[0u8; 32]);
        bytes
    }

    fn preprocessor(sink: &Arc<EventSink>) -> Preprocessor {
        Preprocessor::new(PreprocessConfig::default(), sink.clone())
    }

    #[test]
    fn test_correction_angle() {
        assert_eq!(correction_angle(0), 0);
        assert_eq!(correction_angle(90), 270);
        assert_eq!(correction_angle(180), 180);
        assert_eq!(correction_angle(270), 90);
        assert_eq!(correction_angle(-90), 90);
    }

    #[test]
    fn test_quarter_turn_swaps_dimensions() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(30, 10));
        let rotated = rotate_image(&image, 90);
        assert_eq!((rotated.width(), rotated.height()), (10, 30));
        let half = rotate_image(&image, 180);
        assert_eq!((half.width(), half.height()), (30, 10));
    }

    #[test]
    fn test_exif_rotation_mapping() {
        assert_eq!(exif_rotation(Orientation::NoTransforms), None);
        assert_eq!(exif_rotation(Orientation::Rotate90), Some(90));
        assert_eq!(exif_rotation(Orientation::Rotate270), Some(270));
        assert_eq!(exif_rotation(Orientation::FlipHorizontal), None);
    }

    #[test]
    fn test_heif_detection() {
        assert!(is_heif(&heic_bytes(), None));
        assert!(is_heif(b"", Some("heic")));
        assert!(!is_heif(&png_bytes(2, 2), Some("png")));
    }

    #[tokio::test]
    async fn test_image_work_leaves_the_async_thread() {
        let caller = std::thread::current().id();
        let worker = off_runtime(|| Ok(std::thread::current().id())).await.unwrap();
        assert_ne!(caller, worker);
    }

    #[tokio::test]
    async fn test_panicking_image_work_is_a_preprocess_error() {
        let err = off_runtime(|| -> Result<()> { panic!("corrupt raster") })
            .await
            .unwrap_err();
        assert!(
            matches!(err, ClientError::Preprocess(ref m) if m.starts_with("image task failed"))
        );
    }

    #[tokio::test]
    async fn test_low_confidence_leaves_image_unrotated() {
        let sink = Arc::new(EventSink::new(100));
        let detector = FixedDetector::new(90, 0.1);
        let pre = preprocessor(&sink).with_orientation_detector(detector.clone());

        let input = png_bytes(10, 10);
        let result = pre.process(InputFile::new("r.png", input.clone()), true).await;

        assert_eq!(detector.calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.rotation_degrees(), 0);
        assert_eq!(result.image.bytes, input);

        let warnings = sink.entries(&LogFilter::level(LogLevel::Warn));
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("no correction needed or low confidence"));
    }

    #[tokio::test]
    async fn test_detected_quarter_turn_is_corrected() {
        let sink = Arc::new(EventSink::new(100));
        let pre = preprocessor(&sink).with_orientation_detector(FixedDetector::new(90, 0.8));

        let result = pre.process(InputFile::new("r.png", png_bytes(10, 20)), true).await;

        assert_eq!(result.rotation_degrees(), 270);
        assert_eq!(result.rotation_sources(), vec![RotationSource::ContentDetection]);
        assert_eq!((result.image.width, result.image.height), (20, 10));
        assert_eq!(result.image.mime, "image/png");

        let successes = sink.entries(&LogFilter::level(LogLevel::Success));
        assert_eq!(successes.len(), 1);
        assert!(successes[0].message.contains("270"));
    }

    #[tokio::test]
    async fn test_detection_skipped_when_remote_unreachable() {
        let sink = Arc::new(EventSink::new(100));
        let detector = FixedDetector::new(180, 0.9);
        let pre = preprocessor(&sink).with_orientation_detector(detector.clone());

        let result = pre.process(InputFile::new("r.png", png_bytes(4, 4)), false).await;
        assert_eq!(detector.calls.load(Ordering::SeqCst), 0);
        assert!(result.transformations.is_empty());
    }

    #[tokio::test]
    async fn test_detector_failure_is_not_fatal() {
        let sink = Arc::new(EventSink::new(100));
        let pre = preprocessor(&sink).with_orientation_detector(Arc::new(FailingDetector));

        let input = png_bytes(6, 6);
        let result = pre.process(InputFile::new("r.png", input.clone()), true).await;
        assert_eq!(result.image.bytes, input);
        assert!(sink
            .entries(&LogFilter::level(LogLevel::Warn))
            .iter()
            .any(|e| e.message.contains("connection reset")));
    }

    #[tokio::test]
    async fn test_unaccepted_format_is_converted_to_jpeg() {
        let sink = Arc::new(EventSink::new(100));
        let image = DynamicImage::ImageRgb8(RgbImage::new(5, 3));
        let mut pnm = Vec::new();
        image.write_to(&mut Cursor::new(&mut pnm), ImageFormat::Pnm).unwrap();

        let result = preprocessor(&sink).process(InputFile::new("scan.ppm", pnm), false).await;

        assert!(result.format_converted());
        assert_eq!(result.image.mime, "image/jpeg");
        assert_eq!(result.image.file_name, "scan.jpg");
        assert_eq!(image::guess_format(&result.image.bytes).unwrap(), ImageFormat::Jpeg);
    }

    #[tokio::test]
    async fn test_container_conversion_skips_exif_step() {
        let sink = Arc::new(EventSink::new(100));
        let pre = preprocessor(&sink).with_container_decoder(Arc::new(SolidDecoder));

        let result = pre.process(InputFile::new("IMG_0001.HEIC", heic_bytes()), false).await;

        assert!(result.format_converted());
        assert!(result.rotation_sources().is_empty());
        assert_eq!((result.image.width, result.image.height), (8, 4));
        assert_eq!(result.image.file_name, "IMG_0001.jpg");
    }

    #[tokio::test]
    async fn test_container_without_decoder_passes_through() {
        let sink = Arc::new(EventSink::new(100));
        let bytes = heic_bytes();
        let result = preprocessor(&sink)
            .process(InputFile::new("IMG.heic", bytes.clone()), true)
            .await;

        assert!(!result.format_converted());
        assert_eq!(result.image.bytes, bytes);
        assert_eq!(result.image.mime, "image/heic");
    }

    #[tokio::test]
    async fn test_garbage_input_is_forwarded_untouched() {
        let sink = Arc::new(EventSink::new(100));
        let result = preprocessor(&sink)
            .process(InputFile::new("notes.txt", b"hello".to_vec()), true)
            .await;
        assert_eq!(result.image.bytes, b"hello");
        assert_eq!(result.image.mime, "application/octet-stream");
    }
}
