#![allow(clippy::cast_possible_truncation)]

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const KFD_SYSFS_PATH: &str = "/sys/devices/virtual/kfd/kfd/topology";

const SGPR_SIZE_PER_CU: u32 = 32 * 1024;

/// The subset of a KFD topology node's properties the runtime needs to open a
/// queue and size its buffers.
#[derive(Debug, Clone, Default)]
pub struct HsaNodeProperties {
    pub node_id: u32,
    pub kfd_gpu_id: u32,
    pub marketing_name: String,

    pub cpu_cores_count: u32,
    pub simd_count: u32,
    pub simd_per_cu: u32,
    pub array_count: u32,
    pub simd_arrays_per_engine: u32,
    pub num_xcc: u32,
    pub lds_size_in_kb: u32,
    pub wave_front_size: u32,
    pub max_waves_per_simd: u32,
    pub local_mem_size: u64,
    pub drm_render_minor: i32,
    pub gfx_target_version: u32,

    // Derived
    pub num_shader_banks: u32,
    pub sgpr_size_per_cu: u32,
}

impl HsaNodeProperties {
    #[must_use]
    pub const fn is_gpu(&self) -> bool {
        self.simd_count > 0 && self.kfd_gpu_id != 0
    }

    /// `gfxMmmS` ISA name, e.g. `gfx90a` for target version 90010.
    #[must_use]
    pub fn isa_name(&self) -> String {
        let major = (self.gfx_target_version / 10000) % 100;
        let minor = (self.gfx_target_version / 100) % 100;
        let step = self.gfx_target_version % 100;
        format!("gfx{major}{minor}{step:x}")
    }

    #[must_use]
    pub fn render_node_path(&self) -> Option<PathBuf> {
        (self.drm_render_minor >= 0)
            .then(|| PathBuf::from(format!("/dev/dri/renderD{}", self.drm_render_minor)))
    }

    fn derive(&mut self) {
        if self.simd_count == 0 {
            return;
        }
        if self.simd_arrays_per_engine != 0 {
            self.num_shader_banks = self.array_count / self.simd_arrays_per_engine;
        }
        self.sgpr_size_per_cu = SGPR_SIZE_PER_CU;
        if self.num_xcc == 0 {
            self.num_xcc = 1;
        }
        if self.marketing_name.is_empty() {
            self.marketing_name = self.isa_name();
        }
    }
}

/// Parses the `properties` file of one topology node.
#[must_use]
pub fn parse_node_properties(content: &str) -> HsaNodeProperties {
    let mut p = HsaNodeProperties::default();

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(k), Some(v)) = (parts.next(), parts.next()) else {
            continue;
        };

        if k == "name" {
            p.marketing_name = v.to_string();
            continue;
        }
        if k == "drm_render_minor" {
            p.drm_render_minor = v.parse().unwrap_or(-1);
            continue;
        }

        let Ok(val) = v.parse::<u64>() else {
            continue;
        };
        match k {
            "cpu_cores_count" => p.cpu_cores_count = val as u32,
            "simd_count" => p.simd_count = val as u32,
            "simd_per_cu" => p.simd_per_cu = val as u32,
            "array_count" => p.array_count = val as u32,
            "simd_arrays_per_engine" => p.simd_arrays_per_engine = val as u32,
            "num_xcc" => p.num_xcc = val as u32,
            "lds_size_in_kb" => p.lds_size_in_kb = val as u32,
            "wave_front_size" => p.wave_front_size = val as u32,
            "max_waves_per_simd" => p.max_waves_per_simd = val as u32,
            "local_mem_size" => p.local_mem_size = val,
            "gfx_target_version" => p.gfx_target_version = val as u32,
            _ => {}
        }
    }
    p
}

fn read_node(path: &Path) -> io::Result<HsaNodeProperties> {
    let content = fs::read_to_string(path.join("properties"))?;
    let mut props = parse_node_properties(&content);

    if let Ok(txt) = fs::read_to_string(path.join("gpu_id"))
        && let Ok(val) = txt.trim().parse::<u32>()
    {
        props.kfd_gpu_id = val;
    }
    Ok(props)
}

/// Reads every node under `root/nodes`, ordered by node index.
///
/// # Errors
/// Returns `NotFound` if the topology directory does not exist.
pub fn read_nodes(root: &Path) -> io::Result<Vec<HsaNodeProperties>> {
    if !root.exists() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            "KFD topology not found",
        ));
    }

    let mut paths: Vec<_> = fs::read_dir(root.join("nodes"))?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .filter_map(|p| {
            let idx = p.file_name()?.to_str()?.parse::<u32>().ok()?;
            Some((idx, p))
        })
        .collect();
    paths.sort_by_key(|(idx, _)| *idx);

    let mut nodes = Vec::with_capacity(paths.len());
    for (idx, path) in paths {
        match read_node(&path) {
            Ok(mut props) => {
                props.node_id = idx;
                props.derive();
                nodes.push(props);
            }
            Err(e) => tracing::warn!(node = idx, error = %e, "skipping unreadable topology node"),
        }
    }
    Ok(nodes)
}

/// GPU nodes of the live system topology.
///
/// # Errors
/// See [`read_nodes`].
pub fn gpu_nodes() -> io::Result<Vec<HsaNodeProperties>> {
    Ok(read_nodes(Path::new(KFD_SYSFS_PATH))?
        .into_iter()
        .filter(HsaNodeProperties::is_gpu)
        .collect())
}
