/*
 * Whisper Bridge - Rust Edition
 * Copyright (c) 2025 Whisper Bridge Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use std::path::Path;

/// Resident set size of this process in megabytes, best effort. Returns
/// 0 when the platform offers no cheap probe.
pub async fn resident_memory_mb() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = tokio::fs::read_to_string("/proc/self/status").await {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:") {
                    let kb: u64 = rest
                        .trim()
                        .trim_end_matches("kB")
                        .trim()
                        .parse()
                        .unwrap_or(0);
                    return kb / 1024;
                }
            }
        }
        0
    }

    #[cfg(not(target_os = "linux"))]
    {
        let pid = std::process::id().to_string();
        let output = tokio::process::Command::new("ps")
            .args(["-o", "rss=", "-p", &pid])
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => {
                let kb: u64 = String::from_utf8_lossy(&out.stdout)
                    .trim()
                    .parse()
                    .unwrap_or(0);
                kb / 1024
            }
            _ => 0,
        }
    }
}

/// Sanity-check that the model file exists before attempting a load.
pub fn check_model_file(path: &Path) -> anyhow::Result<()> {
    if !path.is_file() {
        anyhow::bail!("model file not found: {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_probe_does_not_panic() {
        // The exact value is platform-dependent; just make sure the
        // probe runs.
        let _ = resident_memory_mb().await;
    }

    #[test]
    fn missing_model_file_is_reported() {
        assert!(check_model_file(Path::new("/definitely/not/here.bin")).is_err());
    }
}
