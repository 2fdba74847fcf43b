use image::RgbImage;
use opencv::{
    core::{Mat, Point, Rect, Scalar, Vector},
    imgcodecs, imgproc,
    prelude::*,
};
use thiserror::Error;
use yolo_detector::{Detection, ModelHandle};

const LABEL_OFFSET: i32 = 10;

#[derive(Error, Debug)]
pub enum CvUtilsError {
    #[error("Failed to encode frame: {0}")]
    EncodeFrameFailed(opencv::Error),
    #[error("Failed to convert frame: {0}")]
    ConvertFrameFailed(String),
    #[error("OpenCV error: {0}")]
    OpenCvError(opencv::Error),
}

impl From<opencv::Error> for CvUtilsError {
    fn from(err: opencv::Error) -> Self {
        CvUtilsError::OpenCvError(err)
    }
}

/// Text drawn above a box, e.g. `car 0.87`.
pub fn format_label(class_label: &str, confidence: f32) -> String {
    format!("{} {:.2}", class_label, confidence)
}

pub fn encode_jpg(frame: &Mat) -> Result<Vec<u8>, CvUtilsError> {
    let mut buf = Vector::<u8>::new();
    imgcodecs::imencode(".jpg", frame, &mut buf, &Vector::new())
        .map_err(CvUtilsError::EncodeFrameFailed)?;
    Ok(buf.into())
}

/// Copies a BGR frame into an RGB image for the detector.
pub fn mat_to_rgb(frame: &Mat) -> Result<RgbImage, CvUtilsError> {
    let mut rgb = Mat::default();
    imgproc::cvt_color_def(frame, &mut rgb, imgproc::COLOR_BGR2RGB)?;

    let width = rgb.cols() as u32;
    let height = rgb.rows() as u32;
    let data = rgb.data_bytes()?.to_vec();

    RgbImage::from_raw(width, height, data).ok_or_else(|| {
        CvUtilsError::ConvertFrameFailed(format!(
            "buffer does not match a {}x{} RGB frame",
            width, height
        ))
    })
}

/// Draws every detection onto `frame` in place. Leaves the frame untouched
/// when `detections` is empty.
pub fn annotate_frame(
    frame: &mut Mat,
    detections: &[Detection],
    model: &ModelHandle,
) -> Result<(), CvUtilsError> {
    for bbox in detections {
        let x1 = bbox.x1 as i32;
        let y1 = bbox.y1 as i32;
        let x2 = bbox.x2 as i32;
        let y2 = bbox.y2 as i32;
        let class_label = model.label(bbox.class_id);
        let label = format_label(&class_label.label, bbox.confidence);

        let color = Scalar::new(
            class_label.blue as f64,
            class_label.green as f64,
            class_label.red as f64,
            0.0,
        );

        imgproc::rectangle(
            frame,
            Rect::new(x1, y1, x2 - x1, y2 - y1),
            color,
            2,
            imgproc::LINE_8,
            0,
        )?;

        imgproc::put_text(
            frame,
            &label,
            Point::new(x1, y1 - LABEL_OFFSET),
            imgproc::FONT_HERSHEY_SIMPLEX,
            0.5,
            color,
            2,
            imgproc::LINE_AA,
            false,
        )?;
    }
    Ok(())
}
