//! Flattens a scenario tree into the ordered instruction stream both the
//! compiler and the dry-run planner execute, and predicts the resulting
//! segment layout without synthesizing or encoding anything.

use serde::Serialize;

use crate::accumulator::{PendingSegment, SegmentAccumulator};
use crate::schema::{ImageData, Scenario};
use crate::segment::{segment_file_name, BranchIdentity, BranchIndexer};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScriptEvent<'a> {
    /// Start of main-script block `index`; cancellation is checked here.
    Block { index: usize },
    Image { image: &'a ImageData },
    Dialogue {
        role: Option<&'a str>,
        text: &'a str,
        line: usize,
    },
    /// Breakpoint on a main block.
    Breakpoint,
    /// Opens a fresh, isolated track for one branch.
    BranchStart { branch_type: &'a str },
    BranchEnd,
    ScriptEnd,
}

pub fn script_events(scenario: &Scenario) -> Vec<ScriptEvent<'_>> {
    let mut events = Vec::new();

    for (index, block) in scenario.script.iter().enumerate() {
        events.push(ScriptEvent::Block { index });

        if let Some(image) = &block.image {
            events.push(ScriptEvent::Image { image });
        }
        if let Some(text) = block.spoken_text() {
            events.push(ScriptEvent::Dialogue {
                role: block.role.as_deref(),
                text,
                line: index,
            });
        }
        if block.breakpoint.is_some() {
            events.push(ScriptEvent::Breakpoint);
        }

        for branch in block.branches() {
            events.push(ScriptEvent::BranchStart {
                branch_type: &branch.branch_type,
            });
            for (line, dialogue_line) in branch.dialogue.iter().enumerate() {
                if let Some(image) = &dialogue_line.image {
                    events.push(ScriptEvent::Image { image });
                }
                if let Some(text) = dialogue_line.spoken_text() {
                    events.push(ScriptEvent::Dialogue {
                        role: Some(&dialogue_line.role),
                        text,
                        line,
                    });
                }
            }
            events.push(ScriptEvent::BranchEnd);
        }
    }

    events.push(ScriptEvent::ScriptEnd);
    events
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedSegment {
    pub branch_identity: BranchIdentity,
    pub sequence_number: u32,
    pub file_name: String,
    pub lines: Vec<String>,
    pub has_image: bool,
}

/// Predicts every segment a fault-free compile of `scenario` produces, in
/// flush order.
pub fn plan_segments(scenario: &Scenario) -> Vec<PlannedSegment> {
    let mut indexer = BranchIndexer::new();
    let mut planned = Vec::new();
    let mut main = SegmentAccumulator::<String, ()>::new(BranchIdentity::Main);
    let mut branch: Option<SegmentAccumulator<String, ()>> = None;

    let mut record = |pending: Option<PendingSegment<String, ()>>,
                      indexer: &mut BranchIndexer| {
        if let Some(pending) = pending {
            let sequence_number = indexer.get_and_increment(&pending.identity);
            planned.push(PlannedSegment {
                file_name: segment_file_name(&pending.identity, sequence_number),
                branch_identity: pending.identity,
                sequence_number,
                lines: pending.clips,
                has_image: pending.image.is_some(),
            });
        }
    };

    for event in script_events(scenario) {
        let active = branch.as_mut().unwrap_or(&mut main);
        match event {
            ScriptEvent::Block { .. } => {}
            ScriptEvent::Image { .. } => record(active.set_image(()), &mut indexer),
            ScriptEvent::Dialogue { text, .. } => active.add_dialogue(text.to_owned()),
            ScriptEvent::Breakpoint => record(main.flush(), &mut indexer),
            ScriptEvent::BranchStart { branch_type } => {
                branch = Some(SegmentAccumulator::new(BranchIdentity::branch(branch_type)));
            }
            ScriptEvent::BranchEnd => {
                if let Some(mut finished) = branch.take() {
                    record(finished.flush(), &mut indexer);
                }
            }
            ScriptEvent::ScriptEnd => record(main.flush(), &mut indexer),
        }
    }

    planned
}
