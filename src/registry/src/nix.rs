//! Resolver adapter.
//!
//! Invokes the external package resolver (`nixery-prepare-image`) that
//! realises the requested packages and produces the runtime reference
//! graph plus a pre-built symlink-farm layer. The resolver is a black
//! box; this module only knows its invocation contract and the shape of
//! its result file.

use std::path::PathBuf;
use std::process::Stdio;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::time::{timeout, Duration};

use nixery_core::config::Config;
use nixery_core::error::{NixeryError, Result};

use crate::image::Image;
use crate::layers::RuntimeGraph;

/// The symlink-farm layer built by the resolver: a tarball already on
/// local disk, with the digest of its uncompressed content.
#[derive(Debug, Clone, Deserialize)]
pub struct SymlinkLayer {
    pub size: u64,

    #[serde(rename = "tarHash")]
    pub tar_hash: String,

    pub path: PathBuf,
}

/// Output of the resolver for one image request.
///
/// Either the error fields or the success fields are populated,
/// mirroring the resolver's result file.
#[derive(Debug, Deserialize)]
pub struct ImageResult {
    #[serde(default)]
    pub error: String,

    #[serde(default)]
    pub pkgs: Vec<String>,

    #[serde(rename = "runtimeGraph")]
    pub runtime_graph: Option<RuntimeGraph>,

    #[serde(rename = "symlinkLayer")]
    pub symlink_layer: Option<SymlinkLayer>,
}

/// Run the resolver and return its stdout.
///
/// Stderr is streamed into the logs line by line while the build runs.
/// The resolver enforces the timeout on its own builds; the outer guard
/// here additionally kills a hung process.
async fn call_resolver(
    program: &str,
    image: &str,
    args: &[String],
    timeout_secs: u64,
) -> Result<Vec<u8>> {
    let mut child = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| NixeryError::Resolver {
            message: format!("failed to invoke '{}': {}", program, e),
        })?;

    if let Some(stderr) = child.stderr.take() {
        let image = image.to_string();
        let program = program.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::info!(image = %image, cmd = %program, "[nix] {}", line);
            }
        });
    }

    let mut stdout_pipe = child.stdout.take().ok_or_else(|| NixeryError::Resolver {
        message: "resolver stdout was not captured".to_string(),
    })?;

    tracing::info!(image = %image, cmd = %program, "invoked resolver build");

    let read_and_wait = async {
        let mut stdout = Vec::new();
        stdout_pipe.read_to_end(&mut stdout).await?;
        let status = child.wait().await?;
        Ok::<_, std::io::Error>((stdout, status))
    };

    match timeout(Duration::from_secs(timeout_secs), read_and_wait).await {
        Err(_elapsed) => {
            tracing::error!(image = %image, timeout_secs, "resolver timed out, killing it");
            Err(NixeryError::Timeout {
                seconds: timeout_secs,
            })
        }
        Ok(Err(e)) => Err(NixeryError::Resolver {
            message: format!("failed to read resolver output: {}", e),
        }),
        Ok(Ok((stdout, status))) if !status.success() => {
            tracing::error!(
                image = %image,
                cmd = %program,
                code = ?status.code(),
                "resolver invocation failed"
            );
            Err(NixeryError::Resolver {
                message: format!(
                    "resolver exited with {}: {}",
                    status,
                    String::from_utf8_lossy(&stdout).trim()
                ),
            })
        }
        Ok(Ok((stdout, _))) => Ok(stdout),
    }
}

/// Ask the resolver for the metadata of the image to be built. All
/// required store paths are realised, but no layers are created yet.
///
/// Only invoked when the manifest is not found in any cache.
pub async fn prepare_image(config: &Config, image: &Image) -> Result<ImageResult> {
    let packages = serde_json::to_string(&image.packages)?;
    let (src_type, src_args) = config.pkgs.render(&image.tag);

    let args = vec![
        "--timeout".to_string(),
        config.timeout.to_string(),
        "--argstr".to_string(),
        "packages".to_string(),
        packages,
        "--argstr".to_string(),
        "srcType".to_string(),
        src_type,
        "--argstr".to_string(),
        "srcArgs".to_string(),
        src_args,
        "--argstr".to_string(),
        "system".to_string(),
        image.arch.nix_system().to_string(),
    ];

    let stdout = call_resolver(&config.builder, &image.name, &args, config.timeout).await?;

    // Stdout is the path of the result file
    let result_file = String::from_utf8_lossy(&stdout).trim().to_string();
    let output = tokio::fs::read(&result_file)
        .await
        .map_err(|e| NixeryError::Resolver {
            message: format!("failed to read result file '{}': {}", result_file, e),
        })?;

    let result: ImageResult =
        serde_json::from_slice(&output).map_err(|e| NixeryError::Resolver {
            message: format!("failed to parse resolver output: {}", e),
        })?;

    tracing::info!(image = %image.name, tag = %image.tag, "finished image preparation");

    Ok(result)
}
