use serde::{Deserialize, Serialize};

/// Interaction style for a session. Controls retrieval breadth and the
/// prompt flavor; nothing else keys off it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionMode {
    Exploring,
    Research,
    Learning,
}

impl SessionMode {
    pub fn retrieval_count(self) -> usize {
        match self {
            SessionMode::Exploring => 5,
            SessionMode::Research => 10,
            SessionMode::Learning => 7,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionMode::Exploring => "EXPLORING",
            SessionMode::Research => "RESEARCH",
            SessionMode::Learning => "LEARNING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "EXPLORING" => Some(SessionMode::Exploring),
            "RESEARCH" => Some(SessionMode::Research),
            "LEARNING" => Some(SessionMode::Learning),
            _ => None,
        }
    }

    /// Flavor line appended to the system prompt.
    pub fn prompt_flavor(self) -> &'static str {
        match self {
            SessionMode::Exploring => {
                "The user is exploring. Keep answers brisk and curious; surface adjacent \
                 material from the documents when it helps."
            }
            SessionMode::Research => {
                "The user is doing focused research. Be thorough and precise; prefer \
                 quoting and comparing passages over paraphrase."
            }
            SessionMode::Learning => {
                "The user is learning this material. Explain step by step, define terms \
                 on first use, and check understanding with the document's own examples."
            }
        }
    }
}

impl Default for SessionMode {
    fn default() -> Self {
        SessionMode::Exploring
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentStatus::Pending => "PENDING",
            DocumentStatus::Processing => "PROCESSING",
            DocumentStatus::Ready => "READY",
            DocumentStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(DocumentStatus::Pending),
            "PROCESSING" => Some(DocumentStatus::Processing),
            "READY" => Some(DocumentStatus::Ready),
            "FAILED" => Some(DocumentStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnRole {
    User,
    Assistant,
    System,
}

impl TurnRole {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnRole::User => "USER",
            TurnRole::Assistant => "ASSISTANT",
            TurnRole::System => "SYSTEM",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "USER" => Some(TurnRole::User),
            "ASSISTANT" => Some(TurnRole::Assistant),
            "SYSTEM" => Some(TurnRole::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    Fact,
    Preference,
    Insight,
}

impl MemoryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MemoryKind::Fact => "fact",
            MemoryKind::Preference => "preference",
            MemoryKind::Insight => "insight",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fact" => Some(MemoryKind::Fact),
            "preference" => Some(MemoryKind::Preference),
            "insight" => Some(MemoryKind::Insight),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfidenceLevel {
    Low,
    Medium,
    High,
}

impl ConfidenceLevel {
    pub fn from_score(score: f32) -> Self {
        if score < 0.3 {
            ConfidenceLevel::Low
        } else if score < 0.7 {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::High
        }
    }
}
