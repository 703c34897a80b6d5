//! Space hardware descriptors.
//!
//! The hub describes a space's hardware as `·`-separated segments:
//! `"CPU only · 2 vCPU · 16 GiB"` or `"NVIDIA 3090 · 8 vCPU · 32 GiB · 100 GiB storage"`.

use cp_placement::{ResourceRequest, GIB};

use crate::error::ProviderError;
use crate::model::TaskKind;

const CPU_ONLY: &str = "CPU only";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hardware {
    pub kind: TaskKind,
    /// Accelerator product for GPU hardware.
    pub accelerator: Option<String>,
    pub cpu: i64,
    pub memory_gib: i64,
    pub storage_gib: i64,
}

impl Hardware {
    pub fn parse(description: &str) -> Result<Self, ProviderError> {
        let mut segments = description.split('·').map(str::trim).filter(|s| !s.is_empty());
        let head = segments
            .next()
            .ok_or_else(|| ProviderError::validation("empty hardware description"))?;

        let (kind, accelerator) = if head.eq_ignore_ascii_case(CPU_ONLY) {
            (TaskKind::Cpu, None)
        } else {
            (TaskKind::Gpu, Some(head.to_string()))
        };

        let mut hardware = Self {
            kind,
            accelerator,
            cpu: 0,
            memory_gib: 0,
            storage_gib: 0,
        };
        for segment in segments {
            let lower = segment.to_ascii_lowercase();
            if let Some(n) = lower.strip_suffix("vcpu") {
                hardware.cpu = number(n, segment)?;
            } else if let Some(n) = lower.strip_suffix("gib storage") {
                hardware.storage_gib = number(n, segment)?;
            } else if let Some(n) = lower.strip_suffix("gib") {
                hardware.memory_gib = number(n, segment)?;
            }
        }

        if hardware.cpu == 0 {
            return Err(ProviderError::validation(format!(
                "hardware description '{description}' has no vCPU count"
            )));
        }
        Ok(hardware)
    }

    /// Placement request. GPU hardware asks for one accelerator slot.
    pub fn request(&self) -> ResourceRequest {
        let request = ResourceRequest::new(
            self.cpu,
            self.memory_gib.saturating_mul(GIB),
            self.storage_gib.saturating_mul(GIB),
        );
        match &self.accelerator {
            Some(name) => request.with_accelerator(name.clone(), 1),
            None => request,
        }
    }
}

fn number(raw: &str, segment: &str) -> Result<i64, ProviderError> {
    raw.trim()
        .parse()
        .map_err(|_| ProviderError::validation(format!("invalid hardware segment '{segment}'")))
}
