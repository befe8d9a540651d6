/// Latency shape of a simulated server configuration.
#[derive(Debug, Clone)]
pub struct LatencyProfile {
    pub name: &'static str,
    pub description: &'static str,
    pub first_token_ms: f64,
    pub inter_token_ms: f64,
    /// Extra per-token latency for every additional concurrent request.
    pub contention_ms: f64,
    pub output_tokens: u32,
    pub accuracy: f64,
}

const PROFILES: &[LatencyProfile] = &[
    LatencyProfile {
        name: "baseline",
        description: "Plain decoding with no speculative heads.",
        first_token_ms: 45.0,
        inter_token_ms: 12.0,
        contention_ms: 0.35,
        output_tokens: 256,
        accuracy: 0.82,
    },
    LatencyProfile {
        name: "speculative",
        description: "Draft-model speculation: faster decode, slightly slower prefill.",
        first_token_ms: 52.0,
        inter_token_ms: 6.5,
        contention_ms: 0.5,
        output_tokens: 256,
        accuracy: 0.81,
    },
    LatencyProfile {
        name: "broken",
        description: "Misconfigured kernels; answers are garbage.",
        first_token_ms: 40.0,
        inter_token_ms: 5.0,
        contention_ms: 0.2,
        output_tokens: 256,
        accuracy: 0.002,
    },
];

/// Median latencies reported for one benchmark invocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub e2e_ms: f64,
    pub first_token_ms: f64,
    pub inter_token_ms: f64,
    pub throughput: f64,
}

impl LatencyProfile {
    /// Deterministic for a given concurrency and seed; the seed adds up to
    /// 5% jitter so repetitions differ.
    pub fn measure(&self, concurrency: u32, input_len: u32, seed: u64) -> Measurement {
        let concurrency = concurrency.max(1);
        let jitter = 1.0 + (seed.wrapping_mul(2654435761) % 1000) as f64 / 20_000.0;
        let contention = self.contention_ms * f64::from(concurrency - 1);
        let first_token_ms =
            (self.first_token_ms + f64::from(input_len) / 256.0 + contention) * jitter;
        let inter_token_ms = (self.inter_token_ms + contention) * jitter;
        let e2e_ms = first_token_ms + inter_token_ms * f64::from(self.output_tokens);
        let throughput =
            f64::from(concurrency) * f64::from(self.output_tokens) / (e2e_ms / 1000.0);
        Measurement {
            e2e_ms,
            first_token_ms,
            inter_token_ms,
            throughput,
        }
    }
}

pub fn default_profile() -> &'static LatencyProfile {
    &PROFILES[0]
}

pub fn profiles() -> &'static [LatencyProfile] {
    PROFILES
}

pub fn find_profile(name: &str) -> Option<&'static LatencyProfile> {
    let needle = name.trim();
    if needle.is_empty() {
        return None;
    }
    PROFILES
        .iter()
        .find(|profile| profile.name.eq_ignore_ascii_case(needle))
}
