use std::path::{Path, PathBuf};

use opencv::{
    core::{self, Mat},
    prelude::*,
    videoio,
};

use crate::error::Error;

/// Lazily opened output video; (re)created whenever the frame size changes.
pub struct VideoWriter {
    writer: Option<videoio::VideoWriter>,
    size: Option<(i32, i32)>,
    out_file: PathBuf,
    fps: f64,
}

impl VideoWriter {
    pub fn new<P: AsRef<Path>>(out_file: P, fps: f64) -> Self {
        Self {
            writer: None,
            size: None,
            out_file: out_file.as_ref().to_path_buf(),
            fps: if fps > 0.0 { fps } else { 24.0 },
        }
    }

    pub fn release(&mut self) -> Result<(), Error> {
        if let Some(mut w) = self.writer.take() {
            w.release()?;
        }

        Ok(())
    }

    fn reinit(&mut self, size: (i32, i32)) -> Result<(), Error> {
        self.release()?;

        let writer = videoio::VideoWriter::new(
            &self.out_file.to_string_lossy(),
            videoio::VideoWriter::fourcc('X', 'V', 'I', 'D')?,
            self.fps,
            core::Size::new(size.0, size.1),
            true,
        )?;

        tracing::info!(
            "writing {}x{} video to {}",
            size.0,
            size.1,
            self.out_file.display()
        );

        self.size = Some(size);
        self.writer = Some(writer);

        Ok(())
    }

    pub fn feed(&mut self, m: &Mat) -> Result<(), Error> {
        let size = (m.cols(), m.rows());

        if self.writer.is_none() || self.size != Some(size) {
            self.reinit(size)?;
        }

        if let Some(writer) = self.writer.as_mut() {
            writer.write(m)?;
        }

        Ok(())
    }
}

impl Drop for VideoWriter {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::warn!("failed to finalize {}: {}", self.out_file.display(), err);
        }
    }
}
