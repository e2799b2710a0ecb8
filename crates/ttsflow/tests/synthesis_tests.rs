use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use ttsflow::{
    Capabilities, ConfigError, EngineConfig, NullDeviceProvider, Property, SessionError,
    SessionOutcome, SynthesisAdapter, SynthesisError, SynthesisOptions, SynthesisOutput,
    SynthesisResult, TimingSource, TtsEngine, Utterance, VoiceIdentifier,
};
use ttsflow_test_utils::{RecordingDeviceProvider, StubAdapter, init_logging};

fn engine(adapter: &Arc<StubAdapter>, config: EngineConfig) -> TtsEngine {
    TtsEngine::from_shared(adapter.clone(), Arc::new(NullDeviceProvider), config).unwrap()
}

#[tokio::test]
async fn estimated_timings_stay_inside_their_chunk() {
    let adapter = Arc::new(StubAdapter::new());
    let engine = engine(&adapter, EngineConfig::default());

    let audio = engine
        .synthesize(Utterance::text(
            "Hello world. This is a test. A longer sentence with several more words in it.",
        ))
        .await
        .unwrap();

    assert_eq!(audio.frames().len(), 3);
    for frame in audio.frames() {
        let duration = frame.duration();
        assert!(!frame.timings.is_empty());
        assert_eq!(frame.timing_source(), Some(TimingSource::Estimated));
        for pair in frame.timings.windows(2) {
            assert!(pair[0].start < pair[1].start);
            assert!(pair[0].end <= pair[1].start + 1e-12);
        }
        let last_end = frame.timings.iter().map(|t| t.end).fold(0.0, f64::max);
        assert!(last_end <= duration + 1e-12);
        let covered: f64 = frame.timings.iter().map(|t| t.duration()).sum();
        assert!((covered - duration).abs() < 1e-9);
    }

    let timings = audio.word_timings();
    assert_eq!(timings.len(), 2 + 4 + 9);
    assert!((timings[2].start - audio.frames()[0].duration()).abs() < 1e-9);
    assert!((audio.duration() - timings.last().unwrap().end).abs() < 1e-9);
}

#[tokio::test]
async fn native_timings_are_kept_and_marked() {
    let adapter = Arc::new(
        StubAdapter::new().with_capabilities(Capabilities::default().with_native_timing()),
    );
    let engine = engine(&adapter, EngineConfig::default());

    let audio = engine
        .synthesize(Utterance::text("Hello world."))
        .await
        .unwrap();
    let timings = audio.word_timings();
    assert_eq!(timings.len(), 2);
    assert!(timings.iter().all(|t| t.source == TimingSource::Native));
    assert_eq!(timings[0].word, "Hello");
}

struct StartsOnly;

#[async_trait]
impl SynthesisAdapter for StartsOnly {
    async fn synthesize(
        &self,
        _text: &str,
        _voice: Option<&VoiceIdentifier>,
        _options: &SynthesisOptions,
    ) -> SynthesisResult<SynthesisOutput> {
        Ok(SynthesisOutput::from_samples(&vec![0; 16_000], 16_000)
            .with_word_starts(vec![(0.0, "Hello".to_string()), (0.4, "world".to_string())]))
    }

    fn name(&self) -> &str {
        "starts-only"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default().with_native_timing()
    }
}

#[tokio::test]
async fn start_only_timings_are_completed_from_the_next_word() {
    let engine = TtsEngine::new(StartsOnly, NullDeviceProvider, EngineConfig::default()).unwrap();

    let audio = engine
        .synthesize(Utterance::text("Hello world"))
        .await
        .unwrap();
    let timings = audio.word_timings();
    assert_eq!(timings.len(), 2);
    assert_eq!((timings[0].start, timings[0].end), (0.0, 0.4));
    assert_eq!(timings[1].start, 0.4);
    assert!((timings[1].end - 1.0).abs() < 1e-9);
    assert_eq!(timings[1].source, TimingSource::Native);
}

struct WavPayload;

#[async_trait]
impl SynthesisAdapter for WavPayload {
    async fn synthesize(
        &self,
        _text: &str,
        _voice: Option<&VoiceIdentifier>,
        _options: &SynthesisOptions,
    ) -> SynthesisResult<SynthesisOutput> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 22_050,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut payload = std::io::Cursor::new(Vec::new());
        let mut writer = hound::WavWriter::new(&mut payload, spec)
            .map_err(|err| SynthesisError::backend("wav", err.to_string()))?;
        for sample in 0..2205i16 {
            writer
                .write_sample(sample)
                .map_err(|err| SynthesisError::backend("wav", err.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|err| SynthesisError::backend("wav", err.to_string()))?;
        // Header rate wins over the declared one
        Ok(SynthesisOutput::new(payload.into_inner(), 16_000))
    }

    fn name(&self) -> &str {
        "wav"
    }
}

#[tokio::test]
async fn wav_payloads_are_unwrapped() {
    let engine = TtsEngine::new(WavPayload, NullDeviceProvider, EngineConfig::default()).unwrap();

    let audio = engine
        .synthesize(Utterance::text("Hello there."))
        .await
        .unwrap();
    assert_eq!(audio.sample_rate(), Some(22_050));
    assert_eq!(audio.samples(), (0..2205i16).collect::<Vec<_>>());
    assert!((audio.duration() - 0.1).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn two_failures_then_success_counts_two_retries() {
    init_logging();
    let adapter = Arc::new(StubAdapter::new().with_failures("Hello", 2));
    let provider = RecordingDeviceProvider::new();
    let engine =
        TtsEngine::from_shared(adapter.clone(), Arc::new(provider.clone()), EngineConfig::default())
            .unwrap();

    let session = engine
        .speak(Utterance::text("Hello world. This is a test."))
        .await
        .unwrap();

    assert_eq!(session.outcome(), Some(SessionOutcome::Finished));
    assert!(session.error().is_none());
    assert_eq!(session.retries(), 2);
    assert_eq!(adapter.calls(), 4);
    let expected: Vec<i16> = ["Hello world.", "This is a test."]
        .iter()
        .flat_map(|t| adapter.render(t))
        .collect();
    assert_eq!(provider.log().samples(), expected);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_error_the_session() {
    let adapter = Arc::new(StubAdapter::new().failing("This"));
    let engine = engine(&adapter, EngineConfig::default().with_max_retries(1));

    let session = engine
        .speak(Utterance::text("Hello world. This is a test."))
        .await
        .unwrap();

    match session.outcome() {
        Some(SessionOutcome::Errored(SessionError::SynthesisExhausted {
            chunk,
            attempts,
            source,
        })) => {
            assert_eq!(chunk, 1);
            assert_eq!(attempts, 2);
            assert!(matches!(source, SynthesisError::Backend { .. }));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(session.retries(), 1);

    let err = engine
        .synthesize(Utterance::text("This fails too."))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::SynthesisExhausted { chunk: 0, .. }));
}

#[tokio::test(start_paused = true)]
async fn slow_backend_times_out() {
    let adapter = Arc::new(StubAdapter::new().with_latency("", Duration::from_secs(2)));
    let config = EngineConfig::default()
        .with_synthesis_timeout_ms(50)
        .with_max_retries(0);
    let engine = engine(&adapter, config);

    let err = engine
        .synthesize(Utterance::text("Too slow."))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::SynthesisExhausted {
            attempts: 1,
            source: SynthesisError::Timeout(_),
            ..
        }
    ));
}

#[tokio::test]
async fn ssml_is_flattened_for_plain_text_backends() {
    let document = "<speak>Hello <emphasis>world</emphasis>. Bye now.</speak>";

    let plain = Arc::new(StubAdapter::new());
    engine(&plain, EngineConfig::default())
        .synthesize(Utterance::new(document))
        .await
        .unwrap();
    let requests = plain.requests();
    assert_eq!(requests.len(), 2);
    for request in &requests {
        assert!(!request.text.contains('<'), "{}", request.text);
        assert!(!request.options.ssml);
    }
    assert!(requests[0].text.contains("Hello") && requests[0].text.contains("world"));

    let ssml = Arc::new(StubAdapter::new().with_capabilities(Capabilities::default().with_ssml()));
    engine(&ssml, EngineConfig::default())
        .synthesize(Utterance::new(document))
        .await
        .unwrap();
    for request in ssml.requests() {
        assert!(request.text.starts_with("<speak"), "{}", request.text);
        assert!(request.options.ssml);
    }
}

#[tokio::test]
async fn engine_properties_and_voice_reach_the_adapter() {
    let adapter = Arc::new(StubAdapter::new());
    let mut engine = engine(
        &adapter,
        EngineConfig::default().with_default_voice("alba"),
    );
    engine.set_property(Property::Rate, 1.5);
    engine.set_property(Property::Pitch, 0.9);
    assert_eq!(engine.property(Property::Rate), Some(1.5));

    engine
        .synthesize(Utterance::text("Hi.").with_property(Property::Pitch, 1.2))
        .await
        .unwrap();
    engine
        .synthesize(Utterance::text("Hi.").with_voice("bob"))
        .await
        .unwrap();
    engine.clear_property(Property::Rate);
    assert_eq!(engine.property(Property::Rate), None);

    let requests = adapter.requests();
    assert_eq!(requests[0].voice, Some(VoiceIdentifier::new("alba")));
    assert_eq!(requests[0].options.properties.rate, Some(1.5));
    assert_eq!(requests[0].options.properties.pitch, Some(1.2));
    assert_eq!(requests[1].voice, Some(VoiceIdentifier::new("bob")));
    assert_eq!(requests[1].options.properties.pitch, Some(0.9));
}

#[cfg(feature = "wav")]
#[tokio::test]
async fn synthesize_to_file_writes_a_wav() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("speech.wav");
    let adapter = Arc::new(StubAdapter::new());
    let engine = engine(&adapter, EngineConfig::default());

    let audio = engine
        .synthesize_to_file(Utterance::text("Hello world. This is a test."), &path)
        .await
        .unwrap();

    let mut reader = hound::WavReader::open(&path).unwrap();
    assert_eq!(reader.spec().channels, 1);
    assert_eq!(reader.spec().sample_rate, 16_000);
    let saved: Vec<i16> = reader.samples::<i16>().map(Result::unwrap).collect();
    assert_eq!(saved, audio.samples());
    assert_eq!(audio.to_le_bytes().len(), saved.len() * 2);
}

#[test]
fn invalid_config_is_rejected_by_the_engine() {
    let err = TtsEngine::new(
        StubAdapter::new(),
        NullDeviceProvider,
        EngineConfig::default().with_max_in_flight(0),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        ConfigError::InvalidValue {
            field: "max_in_flight",
            ..
        }
    ));
}

#[test]
fn engine_loads_config_from_toml_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ttsflow.toml");
    std::fs::write(
        &path,
        "max_in_flight = 4\nperiod_ms = 10\ndefault_voice = { name = \"alba\" }\n",
    )
    .unwrap();

    let config = EngineConfig::from_file(&path).unwrap();
    let engine = TtsEngine::new(StubAdapter::new(), NullDeviceProvider, config).unwrap();
    assert_eq!(engine.config().max_in_flight, 4);
    assert_eq!(engine.config().period_ms, 10);
    assert_eq!(
        engine.config().default_voice,
        Some(VoiceIdentifier::new("alba"))
    );
    assert_eq!(engine.capabilities(), Capabilities::default());
}
