//! Turns a scenario into segment files.
//!
//! The compiler walks the same instruction stream as [`crate::plan`], so a
//! run with no failures writes exactly the planned files. Each segment is
//! numbered when its track flushes; an encode failure is recorded and the
//! run moves on, leaving a gap in that identity's numbering.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::accumulator::{PendingSegment, SegmentAccumulator};
use crate::config::{CompilerConfig, SynthesisFailurePolicy};
use crate::encoding::{concatenate_clips, mux_segment, MediaEncoder};
use crate::error::{CompileError, SegmentError};
use crate::image_source::{placeholder_image, ImageSource};
use crate::plan::{plan_segments, script_events, ScriptEvent};
use crate::scenario::scenario_fingerprint;
use crate::schema::{ImageData, MediaKind, Scenario};
use crate::segment::{segment_path, BranchIdentity, BranchIndexer, SegmentDescriptor};
use crate::synthesis::{SpeechSynthesizer, VoiceCast};
use crate::temp::{ScratchDir, TempMedia};

type Clip = TempMedia;
type Frame = Arc<TempMedia>;
type TrackAccumulator = SegmentAccumulator<Clip, Frame>;

#[derive(Debug, Clone, Serialize)]
pub struct SegmentFailure {
    pub branch_identity: BranchIdentity,
    pub sequence_number: u32,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompileReport {
    pub namespace: String,
    pub output_dir: PathBuf,
    pub segments: Vec<SegmentDescriptor>,
    pub failures: Vec<SegmentFailure>,
    pub scenario_fingerprint: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CompileReport {
    /// Some segments were written but at least one failed.
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

pub struct ScenarioCompiler {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    images: Arc<dyn ImageSource>,
    encoder: Arc<dyn MediaEncoder>,
    config: CompilerConfig,
}

impl ScenarioCompiler {
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        images: Arc<dyn ImageSource>,
        encoder: Arc<dyn MediaEncoder>,
        config: CompilerConfig,
    ) -> Self {
        Self {
            synthesizer,
            images,
            encoder,
            config,
        }
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Compiles `scenario` into `output_dir`, whose final path component is
    /// the namespace. The directory must not be shared with a concurrent
    /// run. `cancel` is checked before every main block and every branch.
    pub async fn compile(
        &self,
        scenario: &Scenario,
        output_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<CompileReport, CompileError> {
        let started_at = Utc::now();
        scenario
            .validate()
            .map_err(|error| CompileError::InvalidScenario(format!("{error:#}")))?;
        let fingerprint = scenario_fingerprint(scenario)
            .map_err(|error| CompileError::InvalidScenario(format!("{error:#}")))?;

        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|source| CompileError::OutputDirectory {
                path: output_dir.to_path_buf(),
                source,
            })?;

        let namespace = output_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| output_dir.display().to_string());

        let scratch = ScratchDir::create(self.config.scratch_dir.as_deref())?;
        let placeholder = placeholder_image(self.config.placeholder)
            .map_err(CompileError::Placeholder)?;
        let placeholder = Arc::new(scratch.write_media(
            "placeholder-",
            MediaKind::Image(placeholder.kind()),
            placeholder.bytes(),
        )?);

        info!(
            namespace = %namespace,
            title = %scenario.title,
            blocks = scenario.script.len(),
            planned = plan_segments(scenario).len(),
            "compiling scenario"
        );

        let mut run = CompileRun {
            compiler: self,
            cast: VoiceCast::from_scenario(scenario, self.config.default_voice.clone()),
            scratch,
            placeholder,
            output_dir: output_dir.to_path_buf(),
            namespace,
            indexer: BranchIndexer::new(),
            segments: Vec::new(),
            failures: Vec::new(),
        };

        let mut main = TrackAccumulator::new(BranchIdentity::Main);
        let mut branch: Option<TrackAccumulator> = None;

        for event in script_events(scenario) {
            let active = branch.as_mut().unwrap_or(&mut main);
            match event {
                ScriptEvent::Block { index } => {
                    run.check_cancelled(cancel)?;
                    debug!(namespace = %run.namespace, block = index, "block");
                }
                ScriptEvent::Image { image } => {
                    let frame = run.resolve_frame(image, active.identity()).await?;
                    let closed = active.set_image(frame);
                    run.emit(closed).await;
                }
                ScriptEvent::Dialogue { role, text, line } => {
                    if let Some(clip) = run.synthesize(active.identity(), role, text, line).await? {
                        active.add_dialogue(clip);
                    }
                }
                ScriptEvent::Breakpoint => run.emit(main.flush()).await,
                ScriptEvent::BranchStart { branch_type } => {
                    run.check_cancelled(cancel)?;
                    branch = Some(TrackAccumulator::new(BranchIdentity::branch(branch_type)));
                }
                ScriptEvent::BranchEnd => {
                    if let Some(mut finished) = branch.take() {
                        run.emit(finished.flush()).await;
                    }
                }
                ScriptEvent::ScriptEnd => run.emit(main.flush()).await,
            }
        }

        if run.segments.is_empty() {
            return Err(CompileError::NoSegments {
                failures: run.failures.len(),
            });
        }

        info!(
            namespace = %run.namespace,
            segments = run.segments.len(),
            failures = run.failures.len(),
            "compile finished"
        );

        Ok(CompileReport {
            namespace: run.namespace,
            output_dir: run.output_dir,
            segments: run.segments,
            failures: run.failures,
            scenario_fingerprint: fingerprint,
            started_at,
            finished_at: Utc::now(),
        })
    }
}

/// Mutable state of one compile run. Dropping it removes every temporary
/// file the run created.
struct CompileRun<'c> {
    compiler: &'c ScenarioCompiler,
    cast: VoiceCast,
    scratch: ScratchDir,
    placeholder: Frame,
    output_dir: PathBuf,
    namespace: String,
    indexer: BranchIndexer,
    segments: Vec<SegmentDescriptor>,
    failures: Vec<SegmentFailure>,
}

impl CompileRun<'_> {
    fn check_cancelled(&self, cancel: &CancellationToken) -> Result<(), CompileError> {
        if cancel.is_cancelled() {
            warn!(
                namespace = %self.namespace,
                produced = self.segments.len(),
                "compile cancelled"
            );
            return Err(CompileError::Cancelled {
                produced: self.segments.len(),
            });
        }
        Ok(())
    }

    /// An image that cannot be resolved still starts a new segment, shown
    /// with the placeholder frame.
    async fn resolve_frame(
        &self,
        image: &ImageData,
        identity: &BranchIdentity,
    ) -> Result<Frame, CompileError> {
        match self.compiler.images.resolve(image).await {
            Ok(still) => {
                let media = self.scratch.write_media(
                    "image-",
                    MediaKind::Image(still.kind()),
                    still.bytes(),
                )?;
                Ok(Arc::new(media))
            }
            Err(error) => {
                warn!(
                    namespace = %self.namespace,
                    branch = identity.label(),
                    error = %error,
                    "image unavailable, using placeholder"
                );
                Ok(Arc::clone(&self.placeholder))
            }
        }
    }

    async fn synthesize(
        &self,
        identity: &BranchIdentity,
        role: Option<&str>,
        text: &str,
        line: usize,
    ) -> Result<Option<Clip>, CompileError> {
        let request = self.cast.request(role, text);
        match self.compiler.synthesizer.synthesize(&request).await {
            Ok(audio) => {
                let clip =
                    self.scratch
                        .write_media("clip-", MediaKind::Audio(audio.kind), &audio.bytes)?;
                Ok(Some(clip))
            }
            Err(source) => match self.compiler.config.on_synthesis_error {
                SynthesisFailurePolicy::Abort => {
                    error!(
                        namespace = %self.namespace,
                        branch = identity.label(),
                        line,
                        error = %source,
                        "synthesis failed, aborting"
                    );
                    Err(CompileError::Synthesis {
                        identity: identity.clone(),
                        line,
                        source,
                    })
                }
                SynthesisFailurePolicy::SkipLine => {
                    warn!(
                        namespace = %self.namespace,
                        branch = identity.label(),
                        line,
                        error = %source,
                        "synthesis failed, skipping line"
                    );
                    Ok(None)
                }
            },
        }
    }

    /// Numbers and encodes a closed segment. Failures are recorded, never
    /// propagated.
    async fn emit(&mut self, pending: Option<PendingSegment<Clip, Frame>>) {
        let Some(pending) = pending else {
            return;
        };
        let identity = pending.identity;
        let sequence_number = self.indexer.get_and_increment(&identity);
        let path = segment_path(&self.output_dir, &identity, sequence_number);
        let frame = pending.image.unwrap_or_else(|| Arc::clone(&self.placeholder));

        match self.encode(&frame, pending.clips, &path).await {
            Ok(duration_secs) => {
                info!(
                    namespace = %self.namespace,
                    branch = identity.label(),
                    sequence = sequence_number,
                    path = %path.display(),
                    duration_secs,
                    "segment written"
                );
                self.segments.push(SegmentDescriptor {
                    path,
                    branch_identity: identity,
                    sequence_number,
                });
            }
            Err(failure) => {
                error!(
                    namespace = %self.namespace,
                    branch = identity.label(),
                    sequence = sequence_number,
                    code = failure.code(),
                    error = %failure,
                    "segment failed"
                );
                self.failures.push(SegmentFailure {
                    branch_identity: identity,
                    sequence_number,
                    code: failure.code().to_owned(),
                    message: failure.to_string(),
                });
            }
        }
    }

    async fn encode(
        &self,
        frame: &TempMedia,
        clips: Vec<Clip>,
        output: &Path,
    ) -> Result<f64, SegmentError> {
        let encoder = self.compiler.encoder.as_ref();
        let track = concatenate_clips(encoder, &self.scratch, clips).await?;
        let duration = mux_segment(encoder, frame.path(), track.path(), output).await?;
        Ok(duration)
    }
}
