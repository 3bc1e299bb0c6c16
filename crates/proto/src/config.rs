//! Model and postencoder configurations carried in control messages

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where the client split the network.
///
/// `Client` means the whole model ran on the device and the payload holds
/// final logits; `Server` means the payload is an untouched camera frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SplitLayer {
    Client,
    Server,
    Named(String),
}

impl From<String> for SplitLayer {
    fn from(name: String) -> Self {
        match name.as_str() {
            "client" => SplitLayer::Client,
            "server" => SplitLayer::Server,
            _ => SplitLayer::Named(name),
        }
    }
}

impl From<SplitLayer> for String {
    fn from(layer: SplitLayer) -> Self {
        match layer {
            SplitLayer::Client => "client".to_string(),
            SplitLayer::Server => "server".to_string(),
            SplitLayer::Named(name) => name,
        }
    }
}

impl fmt::Display for SplitLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplitLayer::Client => f.write_str("client"),
            SplitLayer::Server => f.write_str("server"),
            SplitLayer::Named(name) => f.write_str(name),
        }
    }
}

/// First-stage encoder applied by the client model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncoderKind {
    #[serde(rename = "None", alias = "none")]
    None,

    #[serde(rename = "UniformQuantizationU8Encoder")]
    UniformQuantizationU8,
}

impl fmt::Display for EncoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncoderKind::None => f.write_str("None"),
            EncoderKind::UniformQuantizationU8 => f.write_str("UniformQuantizationU8Encoder"),
        }
    }
}

/// Identifies a split point and compression scheme.
///
/// Used as the model cache key, so only `(model, layer, encoder)` take part.
/// Extra fields sent by clients (`decoder`, `encoder_args`, ...) are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model: String,
    pub layer: SplitLayer,
    pub encoder: EncoderKind,
}

impl ModelConfig {
    pub fn new(model: impl Into<String>, layer: SplitLayer, encoder: EncoderKind) -> Self {
        Self {
            model: model.into(),
            layer,
            encoder,
        }
    }
}

impl fmt::Display for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}&{}", self.model, self.layer, self.encoder)
    }
}

/// Second-stage compression applied on top of the encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PostencoderKind {
    #[default]
    #[serde(rename = "none", alias = "None")]
    None,

    #[serde(rename = "jpeg")]
    Jpeg,

    #[serde(rename = "png")]
    Png,

    #[serde(rename = "jpeg2000")]
    Jpeg2000,
}

impl fmt::Display for PostencoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PostencoderKind::None => f.write_str("none"),
            PostencoderKind::Jpeg => f.write_str("jpeg"),
            PostencoderKind::Png => f.write_str("png"),
            PostencoderKind::Jpeg2000 => f.write_str("jpeg2000"),
        }
    }
}

/// Postencoder selection plus scheme-specific parameters
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct PostencoderConfig {
    #[serde(rename = "type")]
    pub kind: PostencoderKind,

    /// Image codec quality in [1, 100]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,

    /// Rate-control target for the encoded payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_bytes: Option<usize>,
}

impl PostencoderConfig {
    pub fn new(kind: PostencoderKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }
}

/// Control message that (re)configures a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    pub model_config: ModelConfig,

    #[serde(default)]
    pub postencoder_config: PostencoderConfig,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_parse_client_processor_config() {
        let json = r#"{
            "model_config": {
                "model": "resnet34",
                "layer": "add_3",
                "encoder": "UniformQuantizationU8Encoder",
                "decoder": "UniformQuantizationU8Decoder",
                "encoder_args": {"clip_range": [-2.0, 2.0]},
                "decoder_args": {}
            },
            "postencoder_config": {"type": "jpeg", "quality": 80}
        }"#;

        let config: ProcessorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.model_config.model, "resnet34");
        assert_eq!(config.model_config.layer, SplitLayer::Named("add_3".to_string()));
        assert_eq!(config.model_config.encoder, EncoderKind::UniformQuantizationU8);
        assert_eq!(config.postencoder_config.kind, PostencoderKind::Jpeg);
        assert_eq!(config.postencoder_config.quality, Some(80));
    }

    #[test]
    fn test_encoder_aliases() {
        let a: EncoderKind = serde_json::from_str(r#""None""#).unwrap();
        let b: EncoderKind = serde_json::from_str(r#""none""#).unwrap();
        assert_eq!(a, b);

        assert!(serde_json::from_str::<EncoderKind>(r#""Bogus""#).is_err());
    }

    #[test]
    fn test_model_config_is_value_key() {
        let a = ModelConfig::new("resnet34", SplitLayer::Server, EncoderKind::None);
        let b: ModelConfig =
            serde_json::from_str(r#"{"model":"resnet34","layer":"server","encoder":"none"}"#)
                .unwrap();

        let mut set = HashSet::new();
        set.insert(a.clone());
        assert!(set.contains(&b));
        assert_eq!(a.to_string(), "resnet34/server&None");
    }

    #[test]
    fn test_layer_serializes_as_string() {
        let config = ModelConfig::new("resnet34", SplitLayer::Client, EncoderKind::None);
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["layer"], "client");
        assert_eq!(json["encoder"], "None");
    }
}
