use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use lessonreel::compiler::{CompileReport, ScenarioCompiler};
use lessonreel::config::{CompilerConfig, Resolution, SynthesisFailurePolicy};
use lessonreel::encoding::MediaEncoder;
use lessonreel::error::{CompileError, EncodingError, ImageSourceError, MuxError, SynthesisError};
use lessonreel::image_source::{ImageSource, StillImage};
use lessonreel::plan::plan_segments;
use lessonreel::schema::{
    AudioKind, BranchOption, BreakpointOption, BreakpointQuestion, DialogueLine, ImageData,
    ImageKind, Scenario, ScriptBlock,
};
use lessonreel::segment::BranchIdentity;
use lessonreel::synthesis::{SpeechRequest, SpeechSynthesizer, SynthesizedAudio};

const WAV_VOICE: &str = "wav voice";

/// Speaks the text back as bytes. Lines voiced with [`WAV_VOICE`] come back
/// as WAV, everything else as MP3.
#[derive(Default)]
struct EchoSynthesizer {
    fail_on: Option<&'static str>,
    requests: Mutex<Vec<SpeechRequest>>,
}

#[async_trait]
impl SpeechSynthesizer for EchoSynthesizer {
    async fn synthesize(
        &self,
        request: &SpeechRequest,
    ) -> Result<SynthesizedAudio, SynthesisError> {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail_on == Some(request.text.as_str()) {
            return Err(SynthesisError::Service {
                voice: request.voice.clone(),
                message: "quota exceeded".to_owned(),
            });
        }
        let kind = if request.voice == WAV_VOICE {
            AudioKind::Wav
        } else {
            AudioKind::Mp3
        };
        Ok(SynthesizedAudio {
            bytes: request.text.clone().into_bytes(),
            kind,
        })
    }
}

/// Prompt images resolve to their prompt text; the prompt `missing` fails.
struct PromptImages;

#[async_trait]
impl ImageSource for PromptImages {
    async fn resolve(&self, image: &ImageData) -> Result<StillImage, ImageSourceError> {
        match image.prompt.as_deref() {
            Some("missing") | None => Err(ImageSourceError::External("prompt-generated")),
            Some(prompt) => Ok(StillImage::new(prompt.as_bytes().to_vec(), ImageKind::Png)),
        }
    }
}

/// Writes `image=<frame>;audio=<clips joined by |>` instead of video.
#[derive(Default)]
struct FakeEncoder {
    fail_mux_for: Option<&'static str>,
    concat_calls: AtomicUsize,
}

#[async_trait]
impl MediaEncoder for FakeEncoder {
    async fn probe_duration(&self, audio: &Path) -> Result<f64, MuxError> {
        let bytes = tokio::fs::read(audio).await.unwrap();
        Ok(bytes.len() as f64 / 10.0)
    }

    async fn concat_audio(&self, clips: &[PathBuf], output: &Path) -> Result<(), EncodingError> {
        self.concat_calls.fetch_add(1, Ordering::SeqCst);
        let mut joined = Vec::new();
        for (index, clip) in clips.iter().enumerate() {
            if index > 0 {
                joined.push(b'|');
            }
            joined.extend(tokio::fs::read(clip).await.unwrap());
        }
        tokio::fs::write(output, joined).await.unwrap();
        Ok(())
    }

    async fn mux_still(
        &self,
        image: &Path,
        audio: &Path,
        _duration_secs: f64,
        output: &Path,
    ) -> Result<(), MuxError> {
        let file_name = output.file_name().unwrap().to_str().unwrap();
        if self.fail_mux_for == Some(file_name) {
            tokio::fs::write(output, b"partial").await.unwrap();
            return Err(MuxError::Timeout(Duration::from_secs(300)));
        }
        let image = tokio::fs::read(image).await.unwrap();
        let frame = if image.starts_with(b"\x89PNG") {
            "placeholder".to_owned()
        } else {
            String::from_utf8(image).unwrap()
        };
        let audio = String::from_utf8(tokio::fs::read(audio).await.unwrap()).unwrap();
        tokio::fs::write(output, format!("image={frame};audio={audio}"))
            .await
            .unwrap();
        Ok(())
    }
}

fn say(role: &str, text: &str) -> ScriptBlock {
    ScriptBlock {
        role: Some(role.to_owned()),
        dialogue: Some(text.to_owned()),
        ..ScriptBlock::default()
    }
}

fn prompt(text: &str) -> ImageData {
    ImageData {
        prompt: Some(text.to_owned()),
        ..ImageData::default()
    }
}

fn breakpoint() -> BreakpointQuestion {
    BreakpointQuestion {
        question: "Ready?".to_owned(),
        options: vec![BreakpointOption {
            text: "Yes".to_owned(),
            is_correct: true,
            branch_target: None,
        }],
    }
}

fn branch(branch_type: &str, lines: &[&str]) -> BranchOption {
    BranchOption {
        branch_type: branch_type.to_owned(),
        dialogue: lines
            .iter()
            .map(|text| DialogueLine {
                role: "Teacher".to_owned(),
                dialogue: (*text).to_owned(),
                image: None,
            })
            .collect(),
    }
}

fn demo_scenario() -> Scenario {
    let mut welcome = say("Teacher", "Welcome");
    welcome.breakpoint = Some(breakpoint());
    Scenario {
        title: "Demo".to_owned(),
        script: vec![
            say("Narrator", "Hello"),
            welcome,
            ScriptBlock {
                branch_options: Some(vec![branch("A", &["Branch A line"])]),
                ..ScriptBlock::default()
            },
            say("Narrator", "The end"),
        ],
        characters: None,
    }
}

fn test_config(scratch: &Path) -> CompilerConfig {
    CompilerConfig {
        placeholder: Resolution {
            width: 16,
            height: 16,
        },
        scratch_dir: Some(scratch.to_path_buf()),
        ..CompilerConfig::default()
    }
}

fn compiler(
    synthesizer: Arc<EchoSynthesizer>,
    encoder: Arc<FakeEncoder>,
    config: CompilerConfig,
) -> ScenarioCompiler {
    ScenarioCompiler::new(synthesizer, Arc::new(PromptImages), encoder, config)
}

fn file_names(report: &CompileReport) -> Vec<String> {
    report
        .segments
        .iter()
        .map(|segment| {
            segment
                .path
                .file_name()
                .unwrap()
                .to_string_lossy()
                .into_owned()
        })
        .collect()
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap()
}

#[tokio::test]
async fn demo_scenario_writes_segments_in_flush_order() {
    let root = tempdir().unwrap();
    let scratch = tempdir().unwrap();
    let output_dir = root.path().join("Demo");
    let encoder = Arc::new(FakeEncoder::default());
    let compiler = compiler(
        Arc::new(EchoSynthesizer::default()),
        encoder.clone(),
        test_config(scratch.path()),
    );

    let report = compiler
        .compile(&demo_scenario(), &output_dir, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        file_names(&report),
        vec![
            "segment_main_001.mp4",
            "segment_A_001.mp4",
            "segment_main_002.mp4"
        ]
    );
    assert_eq!(report.namespace, "Demo");
    assert!(report.failures.is_empty());
    assert_eq!(report.scenario_fingerprint.len(), 64);
    assert!(report.finished_at >= report.started_at);

    assert_eq!(
        read(&output_dir.join("segment_main_001.mp4")),
        "image=placeholder;audio=Hello|Welcome"
    );
    assert_eq!(
        read(&output_dir.join("segment_A_001.mp4")),
        "image=placeholder;audio=Branch A line"
    );
    assert_eq!(
        read(&output_dir.join("segment_main_002.mp4")),
        "image=placeholder;audio=The end"
    );
    assert_eq!(report.segments[1].branch_identity, BranchIdentity::branch("A"));
    assert_eq!(report.segments[2].sequence_number, 2);

    // Only the two-line segment needed a concat.
    assert_eq!(encoder.concat_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn compiled_layout_matches_the_plan() {
    let decision = || ScriptBlock {
        breakpoint: Some(breakpoint()),
        branch_options: Some(vec![
            branch("Supportive", &["You can do it"]),
            branch("Very Strict", &["Focus", "Again"]),
        ]),
        ..ScriptBlock::default()
    };
    let mut imaged = say("Narrator", "With a picture");
    imaged.image = Some(prompt("classroom"));
    let scenario = Scenario {
        title: "Twice".to_owned(),
        script: vec![
            say("Narrator", "intro"),
            decision(),
            imaged,
            say("Narrator", "middle"),
            decision(),
        ],
        characters: None,
    };

    let root = tempdir().unwrap();
    let scratch = tempdir().unwrap();
    let report = compiler(
        Arc::new(EchoSynthesizer::default()),
        Arc::new(FakeEncoder::default()),
        test_config(scratch.path()),
    )
    .compile(&scenario, &root.path().join("Twice"), &CancellationToken::new())
    .await
    .unwrap();

    let planned = plan_segments(&scenario)
        .into_iter()
        .map(|segment| segment.file_name)
        .collect::<Vec<_>>();
    assert_eq!(file_names(&report), planned);
    assert!(planned.contains(&"segment_Supportive_002.mp4".to_owned()));
    assert!(planned.contains(&"segment_Very_Strict_002.mp4".to_owned()));
    assert_eq!(
        read(&root.path().join("Twice/segment_main_002.mp4")),
        "image=classroom;audio=With a picture|middle"
    );
}

#[tokio::test]
async fn image_only_branch_compiles_without_consuming_a_number() {
    let image_only = BranchOption {
        branch_type: "A".to_owned(),
        dialogue: vec![DialogueLine {
            role: "Teacher".to_owned(),
            dialogue: " ".to_owned(),
            image: Some(prompt("diagram")),
        }],
    };
    let scenario = Scenario {
        title: "Quiet".to_owned(),
        script: vec![
            say("Narrator", "intro"),
            ScriptBlock {
                breakpoint: Some(breakpoint()),
                branch_options: Some(vec![image_only]),
                ..ScriptBlock::default()
            },
            ScriptBlock {
                branch_options: Some(vec![branch("A", &["now speaking"])]),
                ..ScriptBlock::default()
            },
        ],
        characters: None,
    };

    let root = tempdir().unwrap();
    let scratch = tempdir().unwrap();
    let output_dir = root.path().join("Quiet");
    let report = compiler(
        Arc::new(EchoSynthesizer::default()),
        Arc::new(FakeEncoder::default()),
        test_config(scratch.path()),
    )
    .compile(&scenario, &output_dir, &CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(
        file_names(&report),
        vec!["segment_main_001.mp4", "segment_A_001.mp4"]
    );
    let planned = plan_segments(&scenario)
        .into_iter()
        .map(|segment| segment.file_name)
        .collect::<Vec<_>>();
    assert_eq!(file_names(&report), planned);
    assert_eq!(
        read(&output_dir.join("segment_A_001.mp4")),
        "image=placeholder;audio=now speaking"
    );
}

#[tokio::test]
async fn branch_types_sharing_a_file_name_are_rejected_before_writing() {
    let scenario = Scenario {
        title: "Collide".to_owned(),
        script: vec![
            say("Narrator", "intro"),
            ScriptBlock {
                breakpoint: Some(breakpoint()),
                branch_options: Some(vec![branch("A B", &["first"]), branch("A_B", &["second"])]),
                ..ScriptBlock::default()
            },
        ],
        characters: None,
    };

    let root = tempdir().unwrap();
    let scratch = tempdir().unwrap();
    let output_dir = root.path().join("Collide");
    let error = compiler(
        Arc::new(EchoSynthesizer::default()),
        Arc::new(FakeEncoder::default()),
        test_config(scratch.path()),
    )
    .compile(&scenario, &output_dir, &CancellationToken::new())
    .await
    .unwrap_err();

    assert_eq!(error.code(), "E_INVALID_SCENARIO");
    assert!(error.to_string().contains("'A B' and 'A_B'"), "error was: {error}");
    assert!(!output_dir.exists());

    // Without validation the planner still never hands out one name twice.
    let planned = plan_segments(&scenario)
        .into_iter()
        .map(|segment| segment.file_name)
        .collect::<Vec<_>>();
    assert_eq!(
        planned,
        vec![
            "segment_main_001.mp4",
            "segment_A_B_001.mp4",
            "segment_A_B_002.mp4"
        ]
    );
}

#[tokio::test]
async fn image_persists_and_unresolvable_image_still_splits() {
    let mut first = say("Narrator", "one");
    first.image = Some(prompt("sky"));
    let mut broken = say("Narrator", "two");
    broken.image = Some(prompt("missing"));
    let mut after_break = say("Narrator", "three");
    after_break.breakpoint = Some(breakpoint());
    let scenario = Scenario {
        title: "Images".to_owned(),
        script: vec![
            first,
            say("Narrator", "one more"),
            broken,
            after_break,
            say("Narrator", "four"),
        ],
        characters: None,
    };

    let root = tempdir().unwrap();
    let scratch = tempdir().unwrap();
    let output_dir = root.path().join("Images");
    let report = compiler(
        Arc::new(EchoSynthesizer::default()),
        Arc::new(FakeEncoder::default()),
        test_config(scratch.path()),
    )
    .compile(&scenario, &output_dir, &CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(report.segments.len(), 3);
    assert_eq!(
        read(&output_dir.join("segment_main_001.mp4")),
        "image=sky;audio=one|one more"
    );
    assert_eq!(
        read(&output_dir.join("segment_main_002.mp4")),
        "image=placeholder;audio=two|three"
    );
    assert_eq!(
        read(&output_dir.join("segment_main_003.mp4")),
        "image=placeholder;audio=four"
    );
}

#[tokio::test]
async fn mux_failure_is_recorded_and_later_segments_keep_their_numbers() {
    let root = tempdir().unwrap();
    let scratch = tempdir().unwrap();
    let output_dir = root.path().join("Demo");
    let encoder = Arc::new(FakeEncoder {
        fail_mux_for: Some("segment_main_001.mp4"),
        ..FakeEncoder::default()
    });

    let report = compiler(
        Arc::new(EchoSynthesizer::default()),
        encoder,
        test_config(scratch.path()),
    )
    .compile(&demo_scenario(), &output_dir, &CancellationToken::new())
    .await
    .unwrap();

    assert!(report.is_partial());
    assert_eq!(
        file_names(&report),
        vec!["segment_A_001.mp4", "segment_main_002.mp4"]
    );
    assert_eq!(report.failures.len(), 1);
    let failure = &report.failures[0];
    assert_eq!(failure.branch_identity, BranchIdentity::Main);
    assert_eq!(failure.sequence_number, 1);
    assert_eq!(failure.code, "E_MUX_TIMEOUT");
    assert!(!output_dir.join("segment_main_001.mp4").exists());
}

#[tokio::test]
async fn mixed_audio_kinds_fail_only_their_segment() {
    let mut characters = BTreeMap::new();
    characters.insert("Robot".to_owned(), WAV_VOICE.to_owned());
    let mut scenario = demo_scenario();
    scenario.script[0].role = Some("Robot".to_owned());
    scenario.characters = Some(characters);

    let root = tempdir().unwrap();
    let scratch = tempdir().unwrap();
    let encoder = Arc::new(FakeEncoder::default());
    let report = compiler(
        Arc::new(EchoSynthesizer::default()),
        encoder.clone(),
        test_config(scratch.path()),
    )
    .compile(&scenario, &root.path().join("Demo"), &CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].code, "E_ENCODING");
    assert!(report.failures[0].message.contains("audio/wav"));
    assert_eq!(encoder.concat_calls.load(Ordering::SeqCst), 0);
    assert_eq!(report.segments.len(), 2);
}

#[tokio::test]
async fn voices_follow_the_character_map() {
    let mut characters = BTreeMap::new();
    characters.insert("Teacher".to_owned(), "Warm teacher".to_owned());
    let mut scenario = demo_scenario();
    scenario.characters = Some(characters);
    scenario.script.push(ScriptBlock {
        dialogue: Some("No role".to_owned()),
        ..ScriptBlock::default()
    });

    let root = tempdir().unwrap();
    let scratch = tempdir().unwrap();
    let synthesizer = Arc::new(EchoSynthesizer::default());
    let mut config = test_config(scratch.path());
    config.default_voice = "Default narrator".to_owned();
    compiler(synthesizer.clone(), Arc::new(FakeEncoder::default()), config)
        .compile(&scenario, &root.path().join("Demo"), &CancellationToken::new())
        .await
        .unwrap();

    let requests = synthesizer.requests.lock().unwrap();
    let voices = requests
        .iter()
        .map(|request| (request.text.as_str(), request.voice.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(
        voices,
        vec![
            ("Hello", "Default narrator"),
            ("Welcome", "Warm teacher"),
            ("Branch A line", "Warm teacher"),
            ("The end", "Default narrator"),
            ("No role", "Default narrator"),
        ]
    );
}

#[tokio::test]
async fn synthesis_failure_aborts_by_default() {
    let root = tempdir().unwrap();
    let scratch = tempdir().unwrap();
    let synthesizer = Arc::new(EchoSynthesizer {
        fail_on: Some("Welcome"),
        ..EchoSynthesizer::default()
    });

    let error = compiler(
        synthesizer,
        Arc::new(FakeEncoder::default()),
        test_config(scratch.path()),
    )
    .compile(&demo_scenario(), &root.path().join("Demo"), &CancellationToken::new())
    .await
    .unwrap_err();

    match error {
        CompileError::Synthesis { identity, line, .. } => {
            assert_eq!(identity, BranchIdentity::Main);
            assert_eq!(line, 1);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(fs::read_dir(scratch.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn skip_line_policy_drops_only_the_failed_line() {
    let root = tempdir().unwrap();
    let scratch = tempdir().unwrap();
    let output_dir = root.path().join("Demo");
    let synthesizer = Arc::new(EchoSynthesizer {
        fail_on: Some("Welcome"),
        ..EchoSynthesizer::default()
    });
    let mut config = test_config(scratch.path());
    config.on_synthesis_error = SynthesisFailurePolicy::SkipLine;

    let report = compiler(synthesizer, Arc::new(FakeEncoder::default()), config)
        .compile(&demo_scenario(), &output_dir, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.segments.len(), 3);
    assert_eq!(
        read(&output_dir.join("segment_main_001.mp4")),
        "image=placeholder;audio=Hello"
    );
}

#[tokio::test]
async fn scenario_without_speech_is_a_failure() {
    let mut silent = ScriptBlock {
        image: Some(prompt("slide")),
        ..ScriptBlock::default()
    };
    silent.dialogue = Some("   ".to_owned());
    let scenario = Scenario {
        title: "Silent".to_owned(),
        script: vec![silent],
        characters: None,
    };

    let root = tempdir().unwrap();
    let scratch = tempdir().unwrap();
    let error = compiler(
        Arc::new(EchoSynthesizer::default()),
        Arc::new(FakeEncoder::default()),
        test_config(scratch.path()),
    )
    .compile(&scenario, &root.path().join("Silent"), &CancellationToken::new())
    .await
    .unwrap_err();

    assert!(matches!(error, CompileError::NoSegments { failures: 0 }));
    assert_eq!(error.code(), "E_NO_SEGMENTS");
}

#[tokio::test]
async fn cancelled_run_stops_before_the_next_block() {
    let root = tempdir().unwrap();
    let scratch = tempdir().unwrap();
    let output_dir = root.path().join("Demo");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let error = compiler(
        Arc::new(EchoSynthesizer::default()),
        Arc::new(FakeEncoder::default()),
        test_config(scratch.path()),
    )
    .compile(&demo_scenario(), &output_dir, &cancel)
    .await
    .unwrap_err();

    assert!(matches!(error, CompileError::Cancelled { produced: 0 }));
    assert_eq!(fs::read_dir(&output_dir).unwrap().count(), 0);
    assert_eq!(fs::read_dir(scratch.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn temporary_files_are_removed_after_the_run() {
    let root = tempdir().unwrap();
    let scratch = tempdir().unwrap();
    let mut scenario = demo_scenario();
    scenario.script[0].image = Some(prompt("board"));

    compiler(
        Arc::new(EchoSynthesizer::default()),
        Arc::new(FakeEncoder::default()),
        test_config(scratch.path()),
    )
    .compile(&scenario, &root.path().join("Demo"), &CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(fs::read_dir(scratch.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn recompiling_into_a_fresh_namespace_is_structurally_identical() {
    let scratch = tempdir().unwrap();
    let compiler = compiler(
        Arc::new(EchoSynthesizer::default()),
        Arc::new(FakeEncoder::default()),
        test_config(scratch.path()),
    );
    let first_root = tempdir().unwrap();
    let second_root = tempdir().unwrap();

    let first = compiler
        .compile(
            &demo_scenario(),
            &first_root.path().join("Demo"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    let second = compiler
        .compile(
            &demo_scenario(),
            &second_root.path().join("Demo"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(file_names(&first), file_names(&second));
    assert_eq!(first.scenario_fingerprint, second.scenario_fingerprint);
}

#[tokio::test]
async fn unusable_output_directory_aborts_immediately() {
    let root = tempdir().unwrap();
    let blocker = root.path().join("taken");
    fs::write(&blocker, b"not a directory").unwrap();
    let scratch = tempdir().unwrap();

    let error = compiler(
        Arc::new(EchoSynthesizer::default()),
        Arc::new(FakeEncoder::default()),
        test_config(scratch.path()),
    )
    .compile(&demo_scenario(), &blocker.join("Demo"), &CancellationToken::new())
    .await
    .unwrap_err();

    assert_eq!(error.code(), "E_OUTPUT_DIRECTORY");
}
