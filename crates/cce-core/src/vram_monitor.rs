//! Platform GPU memory probing, queried once at session start.
//!
//! Detection order mirrors the common desktop stack: CUDA (NVIDIA) first via
//! `nvidia-smi`, then ROCm (AMD) via `rocm-smi`, then Apple Silicon's unified
//! memory via `system_profiler`. Any probe that errors, times out, or parses
//! unexpected output is treated as absent, not fatal; the caller falls back
//! to the model's `default_context`.

use std::process::Command;

use tracing::debug;

/// Result of a VRAM probe: a concrete reading, or an explicit "could not
/// determine" rather than a sentinel integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VramInfo {
    Known(u64),
    Unknown,
}

impl VramInfo {
    pub fn megabytes(&self) -> Option<u64> {
        match self {
            VramInfo::Known(mb) => Some(*mb),
            VramInfo::Unknown => None,
        }
    }
}

pub struct VramMonitor;

impl VramMonitor {
    /// Detects free (not total) GPU memory, in megabytes, trying each
    /// backend in turn. Called at most once per session.
    pub fn detect() -> VramInfo {
        if let Some(mb) = detect_cuda() {
            return VramInfo::Known(mb);
        }
        if let Some(mb) = detect_rocm() {
            return VramInfo::Known(mb);
        }
        if let Some(mb) = detect_apple_silicon() {
            return VramInfo::Known(mb);
        }
        VramInfo::Unknown
    }
}

fn detect_cuda() -> Option<u64> {
    if !std::path::Path::new("/dev/nvidia0").exists() {
        return None;
    }
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=memory.free", "--format=csv,noheader,nounits"])
        .output()
        .ok()?;
    if !output.status.success() {
        debug!("nvidia-smi exited non-zero");
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    parse_first_number_mb(&text)
}

fn detect_rocm() -> Option<u64> {
    if !std::path::Path::new("/dev/kfd").exists() {
        return None;
    }
    let output = Command::new("rocm-smi").args(["--showmeminfo", "vram", "--csv"]).output().ok()?;
    if !output.status.success() {
        debug!("rocm-smi exited non-zero");
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    parse_rocm_free_mb(&text)
}

#[cfg(target_os = "macos")]
fn detect_apple_silicon() -> Option<u64> {
    let output = Command::new("system_profiler").args(["SPHardwareDataType"]).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    // Apple Silicon has unified memory; report total RAM, since the GPU can
    // address all of it subject to OS pressure.
    text.lines()
        .find(|line| line.trim_start().starts_with("Memory:"))
        .and_then(|line| line.split(':').nth(1))
        .and_then(parse_gb_to_mb)
}

#[cfg(not(target_os = "macos"))]
fn detect_apple_silicon() -> Option<u64> {
    None
}

fn parse_gb_to_mb(field: &str) -> Option<u64> {
    let trimmed = field.trim().trim_end_matches("GB").trim();
    trimmed.parse::<f64>().ok().map(|gb| (gb * 1024.0) as u64)
}

fn parse_first_number_mb(text: &str) -> Option<u64> {
    text.lines().next()?.trim().parse::<u64>().ok()
}

fn parse_rocm_free_mb(text: &str) -> Option<u64> {
    // rocm-smi --csv emits a header line then `card,VRAM Total Memory (B),VRAM Total Used Memory (B)`.
    let data_line = text.lines().nth(1)?;
    let fields: Vec<&str> = data_line.split(',').collect();
    if fields.len() < 3 {
        return None;
    }
    let total_bytes: u64 = fields[1].trim().parse().ok()?;
    let used_bytes: u64 = fields[2].trim().parse().ok()?;
    Some(total_bytes.saturating_sub(used_bytes) / (1024 * 1024))
}

/// Orders context profiles by ascending VRAM estimate, finds the largest
/// profile whose estimate plus `buffer_mb` fits in `free_mb`, then steps one
/// profile smaller for a safety margin (spec §4.7's auto-sizing algorithm).
pub fn select_auto_sized_context<'a>(
    profiles_by_vram_asc: &[&'a cce_memory::ContextProfile],
    free_mb: u64,
    buffer_mb: u64,
) -> Option<&'a cce_memory::ContextProfile> {
    let mut best_index = None;
    for (i, profile) in profiles_by_vram_asc.iter().enumerate() {
        let estimate_mb = (profile.vram_estimate_gb * 1024.0) as u64;
        if estimate_mb + buffer_mb <= free_mb {
            best_index = Some(i);
        }
    }
    let max_fit = best_index?;
    let stepped_down = max_fit.saturating_sub(1);
    profiles_by_vram_asc.get(stepped_down).copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cce_memory::ContextProfile;

    fn profile(label: &str, ctx: usize, vram_gb: f64) -> ContextProfile {
        ContextProfile {
            size: ctx,
            size_label: label.to_string(),
            ollama_context_size: ctx,
            vram_estimate_gb: vram_gb,
        }
    }

    #[test]
    fn vram_info_known_exposes_value() {
        assert_eq!(VramInfo::Known(8192).megabytes(), Some(8192));
        assert_eq!(VramInfo::Unknown.megabytes(), None);
    }

    #[test]
    fn auto_sizing_steps_one_profile_smaller_than_max_fit() {
        let small = profile("small", 4096, 4.0);
        let medium = profile("medium", 6963, 7.0);
        let large = profile("large", 8192, 9.5);
        let profiles = vec![&small, &medium, &large];

        // 10 GB free, 1 GB buffer: medium (7.0) and large (9.5+1=10.5 > 10) -- large doesn't fit.
        // max fit is medium; stepped down is small.
        let chosen = select_auto_sized_context(&profiles, 10 * 1024, 1024).unwrap();
        assert_eq!(chosen.size_label, "small");
    }

    #[test]
    fn auto_sizing_returns_none_when_nothing_fits() {
        let small = profile("small", 4096, 4.0);
        let profiles = vec![&small];
        assert!(select_auto_sized_context(&profiles, 1024, 1024).is_none());
    }

    #[test]
    fn parse_rocm_csv_computes_free_memory() {
        let csv = "device,VRAM Total Memory (B),VRAM Total Used Memory (B)\ncard0,17179869184,8589934592\n";
        let free_mb = parse_rocm_free_mb(csv).unwrap();
        assert_eq!(free_mb, 8192);
    }
}
