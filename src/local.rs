//! In-process fallback engine used when the remote service is unavailable.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::LocalEngineConfig;
use crate::error::{ClientError, Result};
use crate::preprocess::NormalizedImage;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalRecognition {
    pub text: String,
    /// Mean word confidence in `[0, 1]`
    pub confidence: f64,
}

#[async_trait]
pub trait LocalEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn recognize(&self, image: &NormalizedImage) -> Result<LocalRecognition>;
}

/// Runs the `tesseract` command line tool with TSV output.
pub struct TesseractEngine {
    binary: String,
    language: String,
}

impl TesseractEngine {
    pub fn new(config: &LocalEngineConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            language: config.language.clone(),
        }
    }
}

#[async_trait]
impl LocalEngine for TesseractEngine {
    fn name(&self) -> &str {
        "tesseract"
    }

    async fn recognize(&self, image: &NormalizedImage) -> Result<LocalRecognition> {
        let mut child = Command::new(&self.binary)
            .args(["stdin", "stdout", "-l", &self.language, "tsv"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    ClientError::LocalEngine(format!("'{}' not found on PATH", self.binary))
                }
                _ => ClientError::LocalEngine(format!("failed to start '{}': {}", self.binary, e)),
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ClientError::Internal("tesseract stdin not captured".to_string()))?;
        let input = image.bytes.clone();
        let writer = tokio::spawn(async move {
            stdin.write_all(&input).await?;
            stdin.shutdown().await
        });

        let output = child.wait_with_output().await?;
        if let Ok(Err(e)) = writer.await {
            tracing::debug!("tesseract closed stdin early: {}", e);
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ClientError::LocalEngine(format!(
                "tesseract exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(parse_tsv(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Group TSV word rows into lines by (block, paragraph, line).
pub fn parse_tsv(tsv: &str) -> LocalRecognition {
    let mut lines: Vec<((u32, u32, u32), Vec<String>)> = Vec::new();
    let mut confidence_sum = 0.0;
    let mut confidence_count = 0usize;

    for row in tsv.lines().skip(1) {
        let cols: Vec<&str> = row.split('\t').collect();
        if cols.len() < 12 || cols[0] != "5" {
            continue;
        }
        let word = cols[11].trim();
        if word.is_empty() {
            continue;
        }

        let num = |i: usize| cols[i].parse::<u32>().unwrap_or(0);
        let key = (num(2), num(3), num(4));

        if let Ok(conf) = cols[10].parse::<f64>() {
            if conf >= 0.0 {
                confidence_sum += conf;
                confidence_count += 1;
            }
        }

        match lines.last_mut() {
            Some((last, words)) if *last == key => words.push(word.to_string()),
            _ => lines.push((key, vec![word.to_string()])),
        }
    }

    let text = lines
        .iter()
        .map(|(_, words)| words.join(" "))
        .collect::<Vec<_>>()
        .join("\n");

    let confidence = if confidence_count == 0 {
        0.0
    } else {
        confidence_sum / confidence_count as f64 / 100.0
    };

    LocalRecognition { text, confidence }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\t\
                          left\ttop\twidth\theight\tconf\ttext";

    #[test]
    fn test_parse_tsv_groups_lines() {
        let tsv = format!(
            "{}\n\
             1\t1\t0\t0\t0\t0\t0\t0\t100\t100\t-1\t\n\
             5\t1\t1\t1\t1\t1\t0\t0\t10\t10\t90\tCORNER\n\
             5\t1\t1\t1\t1\t2\t0\t0\t10\t10\t80\tMARKET\n\
             5\t1\t1\t1\t2\t1\t0\t0\t10\t10\t70\tMilk\n\
             5\t1\t1\t1\t2\t2\t0\t0\t10\t10\t60\t2.49\n",
            HEADER
        );
        let result = parse_tsv(&tsv);
        assert_eq!(result.text, "CORNER MARKET\nMilk 2.49");
        assert!((result.confidence - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_parse_tsv_empty_output() {
        let result = parse_tsv(HEADER);
        assert_eq!(result, LocalRecognition::default());
    }

    #[tokio::test]
    async fn test_missing_binary_is_local_engine_error() {
        let engine = TesseractEngine::new(&LocalEngineConfig {
            enabled: true,
            binary: "definitely-not-a-real-tesseract".into(),
            language: "eng".into(),
        });
        let image = NormalizedImage {
            file_name: "r.png".into(),
            mime: "image/png".into(),
            bytes: vec![0; 4],
            width: 1,
            height: 1,
        };
        let err = engine.recognize(&image).await.unwrap_err();
        assert!(matches!(err, ClientError::LocalEngine(_)));
    }
}
