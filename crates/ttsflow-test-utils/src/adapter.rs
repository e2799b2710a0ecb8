use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use ttsflow::{
    Capabilities, SynthesisAdapter, SynthesisError, SynthesisOptions, SynthesisOutput,
    SynthesisResult, TimingEstimator, VoiceIdentifier, WordTiming,
};

/// Adapter that renders deterministic audio from the chunk text.
///
/// Latencies and failures are scripted per chunk by text prefix, so tests can
/// make later chunks finish first or make a single chunk flaky.
#[derive(Debug)]
pub struct StubAdapter {
    name: String,
    sample_rate: u32,
    samples_per_char: usize,
    capabilities: Capabilities,
    latencies: Vec<(String, Duration)>,
    failures: Mutex<HashMap<String, u32>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    requests: Mutex<Vec<Request>>,
}

/// One recorded adapter call
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub text: String,
    pub voice: Option<VoiceIdentifier>,
    pub options: SynthesisOptions,
}

impl Default for StubAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl StubAdapter {
    /// 16 kHz output, 40 samples (2.5 ms) per character
    pub fn new() -> Self {
        Self {
            name: "stub".to_string(),
            sample_rate: 16_000,
            samples_per_char: 40,
            capabilities: Capabilities::default(),
            latencies: Vec::new(),
            failures: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_samples_per_char(mut self, samples: usize) -> Self {
        self.samples_per_char = samples;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Delay calls for chunks starting with `prefix`
    pub fn with_latency(mut self, prefix: &str, latency: Duration) -> Self {
        self.latencies.push((prefix.to_string(), latency));
        self
    }

    /// Fail the first `times` calls for chunks starting with `prefix`
    pub fn with_failures(self, prefix: &str, times: u32) -> Self {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(prefix.to_string(), times);
        self
    }

    /// Fail every call for chunks starting with `prefix`
    pub fn failing(self, prefix: &str) -> Self {
        self.with_failures(prefix, u32::MAX)
    }

    /// Total adapter calls, failed ones included
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls that were running at once
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Calls in the order they started
    pub fn requests(&self) -> Vec<Request> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.text).collect()
    }

    /// Samples produced for `text`
    pub fn render(&self, text: &str) -> Vec<i16> {
        let bytes = text.as_bytes();
        if bytes.is_empty() {
            return Vec::new();
        }
        (0..bytes.len() * self.samples_per_char)
            .map(|i| bytes[i / self.samples_per_char] as i16 * 64 + (i % 32) as i16)
            .collect()
    }

    fn latency(&self, text: &str) -> Option<Duration> {
        self.latencies
            .iter()
            .find(|(prefix, _)| text.starts_with(prefix.as_str()))
            .map(|(_, latency)| *latency)
    }

    fn take_failure(&self, text: &str) -> bool {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        for (prefix, remaining) in failures.iter_mut() {
            if text.starts_with(prefix.as_str()) && *remaining > 0 {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                return true;
            }
        }
        false
    }

    fn native_timings(&self, text: &str, duration: f64) -> Vec<WordTiming> {
        let words = TimingEstimator::tokenize(text);
        let step = duration / words.len().max(1) as f64;
        words
            .into_iter()
            .enumerate()
            .map(|(i, word)| WordTiming::native(word, i as f64 * step, (i + 1) as f64 * step))
            .collect()
    }
}

#[async_trait]
impl SynthesisAdapter for StubAdapter {
    async fn synthesize(
        &self,
        text: &str,
        voice: Option<&VoiceIdentifier>,
        options: &SynthesisOptions,
    ) -> SynthesisResult<SynthesisOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Request {
                text: text.to_string(),
                voice: voice.cloned(),
                options: options.clone(),
            });
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);

        if let Some(latency) = self.latency(text) {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.take_failure(text) {
            log::debug!("stub failing call for {text:?}");
            return Err(SynthesisError::backend(&self.name, "scripted failure"));
        }

        let samples = self.render(text);
        let output = SynthesisOutput::from_samples(&samples, self.sample_rate);
        if self.capabilities.supports_native_timing {
            let duration = samples.len() as f64 / self.sample_rate as f64;
            return Ok(output.with_word_timings(self.native_timings(text, duration)));
        }
        Ok(output)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn default_sample_rate(&self) -> u32 {
        self.sample_rate
    }
}
