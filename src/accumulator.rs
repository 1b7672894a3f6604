//! Per-track buffering of dialogue clips under a current image.
//!
//! The accumulator is generic over the clip payload `C` and the image
//! payload `I`, so the compiler drives it with temporary audio files while
//! the planner drives it with plain text.

use crate::segment::BranchIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorState {
    Idle,
    Accumulating,
}

/// A closed span of dialogue ready to be encoded.
#[derive(Debug)]
pub struct PendingSegment<C, I> {
    pub identity: BranchIdentity,
    /// `None` means the placeholder frame.
    pub image: Option<I>,
    pub clips: Vec<C>,
}

#[derive(Debug)]
pub struct SegmentAccumulator<C, I> {
    identity: BranchIdentity,
    image: Option<I>,
    clips: Vec<C>,
}

impl<C, I: Clone> SegmentAccumulator<C, I> {
    pub fn new(identity: BranchIdentity) -> Self {
        Self {
            identity,
            image: None,
            clips: Vec::new(),
        }
    }

    pub fn identity(&self) -> &BranchIdentity {
        &self.identity
    }

    pub fn state(&self) -> AccumulatorState {
        if self.clips.is_empty() {
            AccumulatorState::Idle
        } else {
            AccumulatorState::Accumulating
        }
    }

    pub fn current_image(&self) -> Option<&I> {
        self.image.as_ref()
    }

    /// Adopts a new current image. Buffered dialogue is closed first under
    /// the previous image and returned.
    pub fn set_image(&mut self, image: I) -> Option<PendingSegment<C, I>> {
        let closed = self.flush();
        self.image = Some(image);
        closed
    }

    pub fn add_dialogue(&mut self, clip: C) {
        self.clips.push(clip);
    }

    /// Closes the buffered span. Returns `None` when nothing is buffered.
    /// The current image stays in place for the next span.
    pub fn flush(&mut self) -> Option<PendingSegment<C, I>> {
        if self.clips.is_empty() {
            return None;
        }
        Some(PendingSegment {
            identity: self.identity.clone(),
            image: self.image.clone(),
            clips: std::mem::take(&mut self.clips),
        })
    }
}
