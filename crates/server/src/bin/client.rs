//! Demo client
//!
//! Reads a raw tensor, encodes it the way a split-inference client would for
//! the chosen configuration, sends it as `N` frames and prints every response.

use anyhow::{bail, Context};
use clap::Parser;
use splitinfer_common::config::CodecConfig;
use splitinfer_common::QuantizationParams;
use splitinfer_proto::{
    read_response, write_frame, write_ping, write_processor_config, EncoderKind, ModelConfig,
    PostencoderConfig, PostencoderKind, ProcessorConfig, Response, SplitLayer,
};
use splitinfer_worker::{select_postencoder, AxisOrder, DType, DynTensor, TensorLayout};
use std::path::PathBuf;
use tokio::io::BufReader;
use tokio::net::TcpStream;

#[derive(Parser)]
#[command(author, version, about = "Send frames to a SplitInfer server", long_about = None)]
struct Args {
    /// Server address
    #[arg(long, env = "SPLITINFER_SERVER", default_value = "127.0.0.1:5678")]
    server: String,

    /// Model name
    #[arg(long, default_value = "resnet34")]
    model: String,

    /// Split layer: `client`, `server` or a layer name
    #[arg(long, default_value = "server")]
    layer: String,

    /// Encoder: `None` or `UniformQuantizationU8Encoder`
    #[arg(long, default_value = "None")]
    encoder: String,

    /// Postencoder: `none`, `jpeg`, `png` or `jpeg2000`
    #[arg(long, default_value = "none")]
    postencoder: String,

    /// JPEG quality
    #[arg(long)]
    quality: Option<u8>,

    /// JPEG rate-control target in bytes
    #[arg(long)]
    target_bytes: Option<usize>,

    /// Raw little-endian tensor in height-width-channel order
    #[arg(long, value_name = "FILE")]
    input: PathBuf,

    #[arg(long, default_value = "3")]
    channels: usize,

    #[arg(long, default_value = "224")]
    height: usize,

    #[arg(long, default_value = "224")]
    width: usize,

    /// Element type of the input file: `uint8` or `float32`
    #[arg(long, default_value = "uint8")]
    dtype: String,

    /// Quantization scale, must match the server
    #[arg(long)]
    scale: Option<f32>,

    /// Quantization zero point, must match the server
    #[arg(long)]
    zero_point: Option<f32>,

    /// Number of frames to send
    #[arg(long, default_value = "1")]
    frames: u32,
}

fn parse_json_str<T: serde::de::DeserializeOwned>(value: &str) -> anyhow::Result<T> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .with_context(|| format!("unrecognized value {:?}", value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let encoder: EncoderKind = parse_json_str(&args.encoder)?;
    let kind: PostencoderKind = parse_json_str(&args.postencoder)?;
    let dtype: DType = parse_json_str(&args.dtype)?;

    let config = ProcessorConfig {
        model_config: ModelConfig::new(&args.model, SplitLayer::from(args.layer.clone()), encoder),
        postencoder_config: PostencoderConfig {
            quality: args.quality,
            target_bytes: args.target_bytes,
            ..PostencoderConfig::new(kind)
        },
    };

    let defaults = QuantizationParams::default();
    let quantization = QuantizationParams {
        scale: args.scale.unwrap_or(defaults.scale),
        zero_point: args.zero_point.unwrap_or(defaults.zero_point),
    };

    let layout = TensorLayout::new(args.channels, args.height, args.width, dtype, AxisOrder::Hwc)?;
    let raw = std::fs::read(&args.input)
        .with_context(|| format!("reading {}", args.input.display()))?;
    let tensor = DynTensor::from_le_bytes(&raw, layout.shape(), dtype)?;

    let postencoder = select_postencoder(
        &config.model_config,
        &config.postencoder_config,
        &layout,
        quantization,
        CodecConfig::default().jpeg_quality,
    )?;
    let payload = postencoder.run(&tensor)?;
    println!("encoded {} bytes into {} bytes", raw.len(), payload.len());

    let stream = TcpStream::connect(&args.server)
        .await
        .with_context(|| format!("connecting to {}", args.server))?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    write_processor_config(&mut write_half, &config).await?;
    loop {
        match read_response(&mut reader).await? {
            Some(Response::Ready {
                model_config: Some(model_config),
            }) => {
                println!("ready: {}", model_config);
                break;
            }
            Some(Response::Ready { model_config: None }) => {
                bail!("server holds no model after the handshake")
            }
            Some(Response::Error { kind, message, .. }) => eprintln!("{}: {}", kind, message),
            Some(other) => bail!("unexpected handshake response: {:?}", other),
            None => bail!("server closed the connection during handshake"),
        }
    }

    for frame_number in 1..=args.frames {
        write_frame(&mut write_half, frame_number, &payload).await?;
    }
    write_ping(&mut write_half, u64::from(args.frames)).await?;

    // The ping echo comes after every frame's confirmation and result
    while let Some(response) = read_response(&mut reader).await? {
        println!("{}", serde_json::to_string(&response)?);
        if matches!(response, Response::Ping { .. }) {
            break;
        }
    }

    Ok(())
}
