//! Capability tags: the kinds of work the gateway can dispatch.

use serde::{Deserialize, Serialize};

/// A named kind of work one or more backends can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    LlmCompletion,
    LlmChat,
    VisionAnalyze,
    NlpAnalyze,
    DataProcess,
}

impl Capability {
    /// All capabilities, in routing-table order.
    pub const ALL: [Capability; 5] = [
        Capability::LlmCompletion,
        Capability::LlmChat,
        Capability::VisionAnalyze,
        Capability::NlpAnalyze,
        Capability::DataProcess,
    ];

    /// Stable string form used in metrics labels and API fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::LlmCompletion => "llm_completion",
            Capability::LlmChat => "llm_chat",
            Capability::VisionAnalyze => "vision_analyze",
            Capability::NlpAnalyze => "nlp_analyze",
            Capability::DataProcess => "data_process",
        }
    }

    /// Path suffix for the southbound call on the owning backend.
    pub fn endpoint(&self) -> &'static str {
        match self {
            Capability::LlmCompletion => "/completion",
            Capability::LlmChat => "/chat",
            Capability::VisionAnalyze => "/analyze",
            Capability::NlpAnalyze => "/process",
            Capability::DataProcess => "/process",
        }
    }

    /// Whether requests for this capability are gathered into micro-batches.
    ///
    /// Inference capabilities benefit from batched backend calls; data
    /// processing payloads are too heterogeneous to share a call.
    pub fn batchable(&self) -> bool {
        matches!(
            self,
            Capability::LlmCompletion | Capability::VisionAnalyze | Capability::NlpAnalyze
        )
    }

    /// Whether a request for this capability is replay-stable by default.
    ///
    /// Pure requests are eligible for the response cache and single-flight
    /// coalescing. Sampling-temperature LLM requests are only treated as
    /// pure when the caller opts in via `allow_cache`.
    pub fn pure_by_default(&self) -> bool {
        matches!(
            self,
            Capability::VisionAnalyze | Capability::NlpAnalyze | Capability::DataProcess
        )
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Capability {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "llm_completion" => Ok(Capability::LlmCompletion),
            "llm_chat" => Ok(Capability::LlmChat),
            "vision_analyze" => Ok(Capability::VisionAnalyze),
            "nlp_analyze" => Ok(Capability::NlpAnalyze),
            "data_process" => Ok(Capability::DataProcess),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_names() {
        for cap in Capability::ALL {
            assert_eq!(cap.as_str().parse::<Capability>(), Ok(cap));
        }
    }

    #[test]
    fn test_batchable_set() {
        assert!(Capability::LlmCompletion.batchable());
        assert!(!Capability::LlmChat.batchable());
        assert!(!Capability::DataProcess.batchable());
    }
}
