//! Checkpoint types and their verification prompt templates.
//!
//! Only the visually verifiable types (`location`, `object`, `document`) are
//! available for new tasks. The remaining types are reserved: their templates
//! exist so stored rows still parse, but task submission rejects them.

pub mod evaluator;

pub use evaluator::{
    build_condition, condition_checkpoint_ids, parse_response, CheckpointResult, EvaluatorError,
};

use serde::{Deserialize, Serialize};

/// Default confidence threshold applied when a checkpoint does not set one.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.8;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    Location,
    Object,
    Document,
    Gps,
    Person,
    Action,
    Duration,
    Text,
}

/// Static description of a checkpoint type.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointTemplate {
    pub label: &'static str,
    pub description: &'static str,
    /// Prompt with a `{target}` placeholder.
    pub prompt_template: &'static str,
    pub default_confidence: f64,
    /// `false` means reserved: not accepted for new tasks.
    pub available: bool,
}

impl CheckpointType {
    pub const ALL: [CheckpointType; 8] = [
        Self::Location,
        Self::Object,
        Self::Document,
        Self::Gps,
        Self::Person,
        Self::Action,
        Self::Duration,
        Self::Text,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Location => "location",
            Self::Object => "object",
            Self::Document => "document",
            Self::Gps => "gps",
            Self::Person => "person",
            Self::Action => "action",
            Self::Duration => "duration",
            Self::Text => "text",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    pub fn template(&self) -> CheckpointTemplate {
        match self {
            Self::Location => CheckpointTemplate {
                label: "Location Verification",
                description: "Verify the person is at a specific location",
                prompt_template: "Is the person currently at or near {target}? Look for visual \
                    indicators like signs, landmarks, street names, building facades, or \
                    distinctive features that confirm the location. Respond YES if location is \
                    confirmed, NO if not.",
                default_confidence: 0.8,
                available: true,
            },
            Self::Object => CheckpointTemplate {
                label: "Object Detection",
                description: "Verify a specific object is visible in the scene",
                prompt_template: "Is {target} clearly visible in the current scene? Look \
                    carefully for the object. It should be identifiable and prominently visible. \
                    Respond YES if the object is present, NO if not.",
                default_confidence: 0.8,
                available: true,
            },
            Self::Document => CheckpointTemplate {
                label: "Document Verification",
                description: "Verify a document or receipt is shown to the camera",
                prompt_template: "Is the person showing {target} to the camera? The document \
                    should be legible enough to confirm its type and key details. Respond YES if \
                    the document is visible and identifiable, NO if not.",
                default_confidence: 0.85,
                available: true,
            },
            // Verified by device attestation rather than the video monitor.
            Self::Gps => CheckpointTemplate {
                label: "GPS Geofence",
                description: "Verify the device is within a GPS geofence radius",
                prompt_template: "GPS geofence checkpoint: target coordinates in {target}. \
                    This checkpoint is verified via device GPS, not visual analysis.",
                default_confidence: 0.9,
                available: false,
            },
            Self::Person => CheckpointTemplate {
                label: "Person Detection",
                description: "Verify a specific person or role is present",
                prompt_template: "Is {target} visible in the scene? Look for identifying \
                    characteristics. Respond YES if confirmed, NO if not.",
                default_confidence: 0.75,
                available: false,
            },
            Self::Action => CheckpointTemplate {
                label: "Action Verification",
                description: "Verify a specific action is being performed",
                prompt_template: "Is the person currently performing the following action: \
                    {target}? Respond YES if the action is clearly happening, NO if not.",
                default_confidence: 0.7,
                available: false,
            },
            Self::Duration => CheckpointTemplate {
                label: "Duration Check",
                description: "Verify continuous presence over a time period",
                prompt_template: "Is {target} still present and active in the scene? This is a \
                    duration check, confirm continued presence. Respond YES if still present, NO \
                    if not.",
                default_confidence: 0.7,
                available: false,
            },
            Self::Text => CheckpointTemplate {
                label: "Text Recognition",
                description: "Verify specific text is visible in the scene",
                prompt_template: "Is the text \"{target}\" visible anywhere in the scene? Look \
                    for signs, labels, screens, or documents containing this text. Respond YES \
                    if found, NO if not.",
                default_confidence: 0.85,
                available: false,
            },
        }
    }

    pub fn is_available(&self) -> bool {
        self.template().available
    }

    /// The template prompt with `{target}` filled in.
    pub fn prompt_for(&self, target: &str) -> String {
        self.template().prompt_template.replace("{target}", target)
    }
}

impl std::fmt::Display for CheckpointType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
