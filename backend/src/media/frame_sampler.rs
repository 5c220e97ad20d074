use image::RgbImage;

use super::MediaError;

pub const DEFAULT_FPS: f64 = 30.0;

/// A decoded video frame kept by the sampler.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub frame_number: u64,
    pub timestamp: f64,
}

/// A sequential stream of decoded frames together with the rate the
/// container reports. A rate of 0 means unknown.
pub trait FrameSource: Iterator<Item = Result<RgbImage, MediaError>> {
    fn fps(&self) -> f64;

    /// Advances past one frame without handing out its pixels. `None` at the
    /// end of the stream.
    fn skip_frame(&mut self) -> Option<Result<(), MediaError>> {
        self.next().map(|frame| frame.map(|_| ()))
    }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn fps(&self) -> f64 {
        (**self).fps()
    }

    fn skip_frame(&mut self) -> Option<Result<(), MediaError>> {
        (**self).skip_frame()
    }
}

pub fn effective_fps(reported: f64, fallback: f64) -> f64 {
    if reported.is_finite() && reported > 0.0 {
        reported
    } else {
        fallback
    }
}

pub fn stride_for(fps: f64) -> u64 {
    (fps.round() as u64).max(1)
}

/// Keeps roughly one frame per second of footage: every frame whose index is
/// a multiple of `round(fps)`.
pub struct FrameSampler<S> {
    source: S,
    fps: f64,
    stride: u64,
    next_index: u64,
    finished: bool,
}

impl<S: FrameSource> FrameSampler<S> {
    pub fn new(source: S, fallback_fps: f64) -> Self {
        let fps = effective_fps(source.fps(), fallback_fps);
        Self {
            source,
            fps,
            stride: stride_for(fps),
            next_index: 0,
            finished: false,
        }
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }
}

impl<S: FrameSource> Iterator for FrameSampler<S> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        while !self.finished {
            let frame_number = self.next_index;
            let outcome = if frame_number % self.stride == 0 {
                self.source.next().map(|frame| frame.map(Some))
            } else {
                self.source.skip_frame().map(|skipped| skipped.map(|()| None))
            };
            match outcome {
                None => self.finished = true,
                Some(Err(e)) => {
                    log::warn!("Stopping frame sampling at frame {}: {}", frame_number, e);
                    self.finished = true;
                }
                Some(Ok(image)) => {
                    self.next_index += 1;
                    if let Some(image) = image {
                        return Some(Frame {
                            image,
                            frame_number,
                            timestamp: frame_number as f64 / self.fps,
                        });
                    }
                }
            }
        }
        None
    }
}
