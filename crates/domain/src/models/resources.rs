use serde::{Deserialize, Serialize};

/// 计算资源描述，既用于Worker容量也用于实现的需求
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescription {
    pub cpu_cores: u32,
    pub gpus: u32,
    /// 0 表示不限制
    pub memory_mb: u64,
}

impl ResourceDescription {
    pub fn new(cpu_cores: u32, gpus: u32, memory_mb: u64) -> Self {
        Self {
            cpu_cores,
            gpus,
            memory_mb,
        }
    }

    pub fn cores(cpu_cores: u32) -> Self {
        Self::new(cpu_cores, 0, 0)
    }

    pub fn is_empty(&self) -> bool {
        self.cpu_cores == 0 && self.gpus == 0 && self.memory_mb == 0
    }

    pub fn can_host(&self, requirements: &ResourceDescription) -> bool {
        self.cpu_cores >= requirements.cpu_cores
            && self.gpus >= requirements.gpus
            && (requirements.memory_mb == 0 || self.memory_mb >= requirements.memory_mb)
    }

    /// 可同时容纳多少份需求
    pub fn times_fits(&self, requirements: &ResourceDescription) -> usize {
        if !self.can_host(requirements) {
            return 0;
        }
        let mut fits = usize::MAX;
        if requirements.cpu_cores > 0 {
            fits = fits.min((self.cpu_cores / requirements.cpu_cores) as usize);
        }
        if requirements.gpus > 0 {
            fits = fits.min((self.gpus / requirements.gpus) as usize);
        }
        if requirements.memory_mb > 0 {
            fits = fits.min((self.memory_mb / requirements.memory_mb) as usize);
        }
        if fits == usize::MAX {
            // 没有任何需求的实现按每个核心一个槽位计算
            fits = self.cpu_cores.max(1) as usize;
        }
        fits
    }

    pub fn increase(&mut self, delta: &ResourceDescription) {
        self.cpu_cores += delta.cpu_cores;
        self.gpus += delta.gpus;
        self.memory_mb += delta.memory_mb;
    }

    pub fn reduce(&mut self, delta: &ResourceDescription) {
        self.cpu_cores = self.cpu_cores.saturating_sub(delta.cpu_cores);
        self.gpus = self.gpus.saturating_sub(delta.gpus);
        self.memory_mb = self.memory_mb.saturating_sub(delta.memory_mb);
    }
}
