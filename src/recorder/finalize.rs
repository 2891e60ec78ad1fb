//! Merge the ordered still frames of a session into one video
//!
//! Frames are ordered by the index in their file name, never by directory
//! enumeration order. Intermediates are only deleted once encoding succeeded.

use image::imageops::FilterType;
use image::RgbImage;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::capture::parse_frame_index;

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("no frames to merge in {0:?}")]
    NoFrames(PathBuf),

    #[error("failed to list frames in {path:?}: {source}")]
    ListFrames {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode frame {path:?}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to delete frame {path:?}: {source}")]
    RemoveFrame {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("encoder error: {0}")]
    Encoder(String),
}

/// Opens video writers for a given output file
pub trait VideoEncoder: Send + Sync {
    fn open(
        &self,
        output: &Path,
        width: u32,
        height: u32,
        frame_rate: u32,
    ) -> Result<Box<dyn VideoWriter>, FinalizeError>;
}

/// Accepts frames of exactly the dimensions it was opened with
pub trait VideoWriter {
    fn append(&mut self, frame: &RgbImage) -> Result<(), FinalizeError>;

    /// Flush and close the output; the file is complete once this returns Ok
    fn finish(self: Box<Self>) -> Result<(), FinalizeError>;
}

/// Ensure a value is even (required by yuv420p encoders)
fn make_even(v: u32) -> u32 {
    if v % 2 == 0 {
        v
    } else {
        v + 1
    }
}

/// H.264/MP4 encoding through an external `ffmpeg` fed raw RGB24 frames on stdin
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    program: PathBuf,
}

impl FfmpegEncoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl VideoEncoder for FfmpegEncoder {
    fn open(
        &self,
        output: &Path,
        width: u32,
        height: u32,
        frame_rate: u32,
    ) -> Result<Box<dyn VideoWriter>, FinalizeError> {
        let padded = format!("pad={}:{}", make_even(width), make_even(height));
        debug!(
            "Starting {:?} for {}x{} @ {} fps -> {:?}",
            self.program, width, height, frame_rate, output
        );

        let mut child = Command::new(&self.program)
            .args(["-hide_banner", "-loglevel", "error", "-y"])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24"])
            .arg("-s")
            .arg(format!("{}x{}", width, height))
            .arg("-r")
            .arg(frame_rate.max(1).to_string())
            .args(["-i", "-"])
            .arg("-vf")
            .arg(padded)
            .args(["-c:v", "libx264", "-pix_fmt", "yuv420p", "-movflags", "+faststart"])
            .arg(output)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| FinalizeError::Encoder(format!("failed to start {:?}: {}", self.program, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| FinalizeError::Encoder("encoder stdin unavailable".to_string()))?;

        Ok(Box::new(FfmpegWriter {
            child: Some(child),
            stdin: Some(stdin),
        }))
    }
}

struct FfmpegWriter {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
}

impl VideoWriter for FfmpegWriter {
    fn append(&mut self, frame: &RgbImage) -> Result<(), FinalizeError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| FinalizeError::Encoder("encoder input already closed".to_string()))?;
        stdin
            .write_all(frame.as_raw())
            .map_err(|e| FinalizeError::Encoder(format!("failed to feed frame: {}", e)))
    }

    fn finish(mut self: Box<Self>) -> Result<(), FinalizeError> {
        // EOF on stdin tells ffmpeg to write the trailer
        drop(self.stdin.take());
        let child = self
            .child
            .take()
            .ok_or_else(|| FinalizeError::Encoder("encoder already finished".to_string()))?;
        let output = child
            .wait_with_output()
            .map_err(|e| FinalizeError::Encoder(format!("failed to wait for encoder: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FinalizeError::Encoder(format!(
                "encoder exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

impl Drop for FfmpegWriter {
    fn drop(&mut self) {
        // Abandoned mid-encode
        if let Some(mut child) = self.child.take() {
            drop(self.stdin.take());
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// A frame file and the index parsed from its name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameFile {
    pub index: u64,
    pub path: PathBuf,
}

/// A video produced by [`Finalizer::encode`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedVideo {
    pub path: PathBuf,
    pub frames: usize,
    pub width: u32,
    pub height: u32,
}

pub struct Finalizer {
    encoder: Arc<dyn VideoEncoder>,
    output_file_name: String,
}

impl Finalizer {
    pub fn new(encoder: Arc<dyn VideoEncoder>, output_file_name: impl Into<String>) -> Self {
        Self {
            encoder,
            output_file_name: output_file_name.into(),
        }
    }

    pub fn output_path(&self, directory: &Path) -> PathBuf {
        directory.join(&self.output_file_name)
    }

    /// Frame files in `directory`, sorted ascending by index
    pub fn collect_frames(directory: &Path) -> Result<Vec<FrameFile>, FinalizeError> {
        let entries = std::fs::read_dir(directory).map_err(|source| FinalizeError::ListFrames {
            path: directory.to_path_buf(),
            source,
        })?;

        let mut frames: Vec<FrameFile> = entries
            .flatten()
            .filter_map(|entry| {
                let index = entry.file_name().to_str().and_then(parse_frame_index)?;
                entry
                    .file_type()
                    .ok()
                    .filter(|t| t.is_file())
                    .map(|_| FrameFile {
                        index,
                        path: entry.path(),
                    })
            })
            .collect();

        frames.sort_by_key(|frame| frame.index);
        Ok(frames)
    }

    /// Encode every frame in `directory` into the output video.
    ///
    /// The first frame fixes the video dimensions; later frames of another size
    /// are scaled to match. On failure the partial video is removed and the
    /// frames are left untouched.
    pub fn encode(&self, directory: &Path, frame_rate: u32) -> Result<FinalizedVideo, FinalizeError> {
        let frames = Self::collect_frames(directory)?;
        let Some(first) = frames.first() else {
            return Err(FinalizeError::NoFrames(directory.to_path_buf()));
        };

        let first_image = decode(&first.path)?;
        let (width, height) = first_image.dimensions();
        let output = self.output_path(directory);
        info!(
            "Encoding {} frames ({}x{} @ {} fps) into {:?}",
            frames.len(),
            width,
            height,
            frame_rate,
            output
        );

        let result = self.encode_frames(&output, &frames, first_image, frame_rate);
        if result.is_err() {
            let _ = std::fs::remove_file(&output);
        }
        result?;

        Ok(FinalizedVideo {
            path: output,
            frames: frames.len(),
            width,
            height,
        })
    }

    fn encode_frames(
        &self,
        output: &Path,
        frames: &[FrameFile],
        first_image: RgbImage,
        frame_rate: u32,
    ) -> Result<(), FinalizeError> {
        let (width, height) = first_image.dimensions();
        let mut writer = self.encoder.open(output, width, height, frame_rate)?;
        writer.append(&first_image)?;

        for frame in &frames[1..] {
            let mut image = decode(&frame.path)?;
            if image.dimensions() != (width, height) {
                debug!(
                    "Scaling frame {} from {:?} to {}x{}",
                    frame.index,
                    image.dimensions(),
                    width,
                    height
                );
                image = image::imageops::resize(&image, width, height, FilterType::Triangle);
            }
            writer.append(&image)?;
        }

        writer.finish()
    }

    /// Delete every frame file in `directory`; returns how many were removed
    pub fn remove_frames(directory: &Path) -> Result<usize, FinalizeError> {
        let frames = Self::collect_frames(directory)?;
        let mut removed = 0;
        let mut first_error = None;

        for frame in frames {
            match std::fs::remove_file(&frame.path) {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!("Failed to delete frame {:?}: {}", frame.path, e);
                    first_error.get_or_insert(FinalizeError::RemoveFrame {
                        path: frame.path,
                        source: e,
                    });
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }
}

/// Decode a still frame into the RGB24 layout the encoder consumes
fn decode(path: &Path) -> Result<RgbImage, FinalizeError> {
    image::open(path)
        .map(|image| image.into_rgb8())
        .map_err(|source| FinalizeError::Decode {
            path: path.to_path_buf(),
            source,
        })
}
