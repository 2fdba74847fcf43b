use crate::{
    config::FramePolicy,
    cv_utils::{annotate_frame, encode_jpg, mat_to_rgb, CvUtilsError},
    metrics::Metrics,
    telemetry::TelemetrySink,
};
use opencv::{
    core::{Mat, Size},
    prelude::*,
    videoio::{self, VideoCapture, VideoWriter},
};
use serde::Serialize;
use std::{
    path::{Path, PathBuf},
    time::Instant,
};
use thiserror::Error;
use tracing::instrument;
use yolo_detector::{InferenceError, ModelHandle};

const FALLBACK_FPS: f64 = 30.0;
const OUTPUT_FOURCC: [char; 4] = ['m', 'p', '4', 'v'];
const FRAME_IMAGE_NAME: &str = "Processed Frame";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Unable to open video file {path:?}: {reason}")]
    Open { path: PathBuf, reason: String },
    #[error("Unable to create output video {path:?}: {reason}")]
    CreateOutput { path: PathBuf, reason: String },
    #[error("Frame processing failed: {0}")]
    Frame(#[from] CvUtilsError),
    #[error("OpenCV error: {0}")]
    OpenCv(#[from] opencv::Error),
}

/// Errors that only cost the current frame.
#[derive(Error, Debug)]
enum AnalysisError {
    #[error("{0}")]
    Convert(CvUtilsError),
    #[error("{0}")]
    Inference(#[from] InferenceError),
}

#[derive(Debug, Clone, Copy)]
pub struct RunConfig {
    pub threshold: f32,
    pub frame_policy: FramePolicy,
    pub max_consecutive_read_errors: u32,
}

impl RunConfig {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            frame_policy: FramePolicy::Stop,
            max_consecutive_read_errors: 30,
        }
    }

    /// Whether the loop reads on after `consecutive` failed reads in a row.
    fn keep_reading(&self, consecutive: u32) -> bool {
        self.frame_policy == FramePolicy::SkipCorrupt
            && consecutive < self.max_consecutive_read_errors
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VideoInfo {
    pub width: i32,
    pub height: i32,
    pub fps: f64,
    pub frame_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub output_path: PathBuf,
    pub width: i32,
    pub height: i32,
    pub fps: f64,
    pub frames_written: u64,
    pub frames_annotated: u64,
    pub boxes_drawn: u64,
    pub read_errors: u64,
}

fn path_str(path: &Path) -> Result<&str, String> {
    path.to_str()
        .ok_or_else(|| format!("path {:?} is not valid UTF-8", path))
}

fn open_input(path: &Path) -> Result<VideoCapture, PipelineError> {
    let open_error = |reason: String| PipelineError::Open {
        path: path.to_path_buf(),
        reason,
    };

    if !path.is_file() {
        return Err(open_error("file does not exist".to_string()));
    }

    let capture = VideoCapture::from_file(path_str(path).map_err(open_error)?, videoio::CAP_ANY)
        .map_err(|e| open_error(e.to_string()))?;
    if !capture.is_opened().map_err(|e| open_error(e.to_string()))? {
        return Err(open_error("unsupported or corrupt container".to_string()));
    }

    Ok(capture)
}

fn read_dimensions(capture: &VideoCapture) -> Result<(i32, i32, f64), opencv::Error> {
    let width = capture.get(videoio::CAP_PROP_FRAME_WIDTH)? as i32;
    let height = capture.get(videoio::CAP_PROP_FRAME_HEIGHT)? as i32;
    let fps = capture.get(videoio::CAP_PROP_FPS)?;
    let fps = if fps.is_finite() && fps > 0.0 {
        fps
    } else {
        FALLBACK_FPS
    };
    Ok((width, height, fps))
}

/// Reads a video to the end and reports its geometry and frame count.
pub fn probe(path: &Path) -> Result<VideoInfo, PipelineError> {
    let mut capture = open_input(path)?;
    let (width, height, fps) = read_dimensions(&capture)?;

    let mut frame_count = 0;
    let mut frame = Mat::default();
    while capture.read(&mut frame).unwrap_or(false) && !frame.empty() {
        frame_count += 1;
    }
    capture.release()?;

    Ok(VideoInfo {
        width,
        height,
        fps,
        frame_count,
    })
}

/// Sequential read, detect, draw, write loop over one video.
pub struct FramePipeline<'a> {
    model: &'a ModelHandle,
    telemetry: &'a dyn TelemetrySink,
    metrics: Option<&'a Metrics>,
    config: RunConfig,
}

impl<'a> FramePipeline<'a> {
    pub fn new(model: &'a ModelHandle, telemetry: &'a dyn TelemetrySink, config: RunConfig) -> Self {
        Self {
            model,
            telemetry,
            metrics: None,
            config,
        }
    }

    pub fn with_metrics(mut self, metrics: &'a Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Annotates every frame of `input_path` into a new mp4 at `output_path`.
    ///
    /// Nothing is written when the input cannot be opened.
    #[instrument(skip(self), fields(threshold = self.config.threshold))]
    pub fn run(&self, input_path: &Path, output_path: &Path) -> Result<RunSummary, PipelineError> {
        let mut capture = open_input(input_path)?;
        let (width, height, fps) = read_dimensions(&capture)?;
        if width <= 0 || height <= 0 {
            return Err(PipelineError::Open {
                path: input_path.to_path_buf(),
                reason: "container has no video stream".to_string(),
            });
        }
        tracing::info!("Opened input video {}x{} at {:.2} fps", width, height, fps);

        let mut writer = self.open_output(output_path, width, height, fps)?;

        let mut summary = RunSummary {
            output_path: output_path.to_path_buf(),
            width,
            height,
            fps,
            frames_written: 0,
            frames_annotated: 0,
            boxes_drawn: 0,
            read_errors: 0,
        };
        let mut consecutive_read_errors = 0;

        loop {
            let mut frame = Mat::default();
            match capture.read(&mut frame) {
                Ok(true) if !frame.empty() => consecutive_read_errors = 0,
                Ok(_) => break,
                Err(e) => {
                    summary.read_errors += 1;
                    consecutive_read_errors += 1;
                    if !self.config.keep_reading(consecutive_read_errors) {
                        tracing::warn!(
                            "Read error after {} frames ({} in a row), ending run: {}",
                            summary.frames_written,
                            consecutive_read_errors,
                            e
                        );
                        break;
                    }
                    tracing::warn!("Skipping unreadable frame: {}", e);
                    continue;
                }
            }

            let boxes = match self.analyse_frame(&mut frame) {
                Ok(boxes) => boxes,
                Err(e) if self.config.frame_policy == FramePolicy::Stop => {
                    tracing::warn!(
                        "Frame {} could not be analysed, ending run: {}",
                        summary.frames_written,
                        e
                    );
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        "Frame {} could not be analysed, writing it unannotated: {}",
                        summary.frames_written,
                        e
                    );
                    0
                }
            };

            self.log_frame(&frame, summary.frames_written);
            writer.write(&frame)?;

            summary.frames_written += 1;
            summary.boxes_drawn += boxes as u64;
            if boxes > 0 {
                summary.frames_annotated += 1;
            }
            if let Some(metrics) = self.metrics {
                metrics.record_frame(boxes);
            }
        }

        writer.release()?;
        capture.release()?;

        tracing::info!(
            "Wrote {} frames with {} boxes to {:?}",
            summary.frames_written,
            summary.boxes_drawn,
            output_path
        );
        Ok(summary)
    }

    fn open_output(
        &self,
        output_path: &Path,
        width: i32,
        height: i32,
        fps: f64,
    ) -> Result<VideoWriter, PipelineError> {
        let create_error = |reason: String| PipelineError::CreateOutput {
            path: output_path.to_path_buf(),
            reason,
        };

        let [c1, c2, c3, c4] = OUTPUT_FOURCC;
        let fourcc = VideoWriter::fourcc(c1, c2, c3, c4)?;
        let writer = VideoWriter::new(
            path_str(output_path).map_err(create_error)?,
            fourcc,
            fps,
            Size::new(width, height),
            true,
        )
        .map_err(|e| create_error(e.to_string()))?;

        if !writer.is_opened().map_err(|e| create_error(e.to_string()))? {
            return Err(create_error("no encoder available for mp4v".to_string()));
        }
        Ok(writer)
    }

    /// Runs detection on `frame` and draws the results into it.
    fn analyse_frame(&self, frame: &mut Mat) -> Result<usize, AnalysisError> {
        let rgb = mat_to_rgb(frame).map_err(AnalysisError::Convert)?;

        let started = Instant::now();
        let detections = self.model.detect(&rgb, self.config.threshold)?;
        if let Some(metrics) = self.metrics {
            metrics.record_inference_duration(started.elapsed().as_millis() as u64);
        }

        annotate_frame(frame, &detections, self.model).map_err(AnalysisError::Convert)?;
        Ok(detections.len())
    }

    fn log_frame(&self, frame: &Mat, step: u64) {
        if !self.telemetry.accepts_images() {
            return;
        }
        let result = encode_jpg(frame)
            .map_err(|e| e.to_string())
            .and_then(|jpeg| {
                self.telemetry
                    .log_image(FRAME_IMAGE_NAME, jpeg, step)
                    .map_err(|e| e.to_string())
            });
        if let Err(e) = result {
            tracing::warn!("Failed to log frame {} to telemetry: {}", step, e);
        }
    }
}
