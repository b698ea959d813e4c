use super::RasterFrame;
use crate::error::EncodeError;

/// Raster → compact lossy image. Runs on a blocking worker, never on the
/// controller's event loop.
pub trait FrameEncoder: Send + Sync {
    fn encode(&self, frame: &RasterFrame) -> Result<Vec<u8>, EncodeError>;
}

pub(crate) fn check_layout(frame: &RasterFrame) -> Result<(), EncodeError> {
    if frame.width == 0 || frame.height == 0 || frame.data.is_empty() {
        return Err(EncodeError::EmptyFrame);
    }
    if frame.data.len() != frame.expected_len() {
        return Err(EncodeError::BadLayout {
            width: frame.width,
            height: frame.height,
            actual: frame.data.len(),
        });
    }
    Ok(())
}

#[cfg(feature = "desktop")]
pub use self::jpeg::JpegEncoder;

#[cfg(feature = "desktop")]
mod jpeg {
    use opencv::core::{Mat, Scalar, Vector, CV_8UC3};
    use opencv::imgcodecs;
    use opencv::prelude::*;

    use super::{check_layout, FrameEncoder};
    use crate::camera::RasterFrame;
    use crate::error::EncodeError;

    /// OpenCV JPEG encoder.
    pub struct JpegEncoder {
        quality: i32,
    }

    impl JpegEncoder {
        pub fn new(quality: i32) -> Self {
            Self {
                quality: quality.clamp(1, 100),
            }
        }
    }

    fn backend(e: opencv::Error) -> EncodeError {
        EncodeError::Backend(e.to_string())
    }

    impl FrameEncoder for JpegEncoder {
        fn encode(&self, frame: &RasterFrame) -> Result<Vec<u8>, EncodeError> {
            check_layout(frame)?;
            let mut mat = Mat::new_rows_cols_with_default(
                frame.height as i32,
                frame.width as i32,
                CV_8UC3,
                Scalar::all(0.0),
            )
            .map_err(backend)?;
            mat.data_bytes_mut()
                .map_err(backend)?
                .copy_from_slice(&frame.data);

            let params = Vector::from_iter([imgcodecs::IMWRITE_JPEG_QUALITY, self.quality]);
            let mut buf: Vector<u8> = Vector::new();
            imgcodecs::imencode(".jpg", &mat, &mut buf, &params).map_err(backend)?;
            Ok(buf.to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_layout() {
        assert!(check_layout(&RasterFrame::new(2, 2, vec![0; 12])).is_ok());
        assert!(matches!(
            check_layout(&RasterFrame::new(0, 2, vec![])),
            Err(EncodeError::EmptyFrame)
        ));
        assert!(matches!(
            check_layout(&RasterFrame::new(2, 2, vec![0; 11])),
            Err(EncodeError::BadLayout { actual: 11, .. })
        ));
    }
}
