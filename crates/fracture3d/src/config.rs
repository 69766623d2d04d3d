//! Solver configuration, loadable from JSON or YAML.

use crate::constants::*;
use crate::events::EventFilter;
use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Where the solver's steps run relative to the caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadingMode {
    /// Steps run inline on the calling thread
    #[default]
    SingleThreaded,
    /// One long-lived physics thread fed through a channel
    DedicatedThread,
    /// Steps run as ordered jobs on the rayon pool
    TaskGraph,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SleepConfig {
    pub enabled: bool,
    pub linear_threshold: f32,
    pub angular_threshold: f32,
    pub frames_to_sleep: u32,
}

impl Default for SleepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            linear_threshold: SLEEP_LINEAR_THRESHOLD,
            angular_threshold: SLEEP_ANGULAR_THRESHOLD,
            frames_to_sleep: FRAMES_TO_SLEEP,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    pub max_cluster_level: usize,
    pub collision_strain_factor: f32,
    pub min_impulse_for_strain_eval: f32,
    pub cluster_distance_threshold: f32,
    pub union_damage_threshold: f32,
    pub connection_distance: f32,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            max_cluster_level: MAX_CLUSTER_LEVEL,
            collision_strain_factor: COLLISION_STRAIN_FACTOR,
            min_impulse_for_strain_eval: MIN_IMPULSE_FOR_STRAIN_EVAL,
            cluster_distance_threshold: CLUSTER_DISTANCE_THRESHOLD,
            union_damage_threshold: UNION_DAMAGE_THRESHOLD,
            connection_distance: CONNECTION_DISTANCE,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadingConfig {
    pub mode: ThreadingMode,
    /// Internal step size; `None` steps once per external tick with its dt
    pub fixed_dt: Option<f32>,
    /// Steps taken per tick before the remainder is collapsed into one step
    pub max_substeps: usize,
}

impl Default for ThreadingConfig {
    fn default() -> Self {
        Self {
            mode: ThreadingMode::SingleThreaded,
            fixed_dt: None,
            max_substeps: MAX_SUBSTEPS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewindConfig {
    pub capacity: usize,
    /// Neighbours of corrected bodies are only soft desynced
    pub use_resim_optimization: bool,
    pub desync_tolerance: f32,
}

impl Default for RewindConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_REWIND_CAPACITY,
            use_resim_optimization: true,
            desync_tolerance: DESYNC_TOLERANCE,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SolverConfig {
    #[serde(with = "crate::serde_utils::vec3", default = "default_gravity")]
    pub gravity: Vec3,
    /// Height of the infinite ground plane
    #[serde(default = "default_floor_height")]
    pub floor_height: Option<f32>,
    #[serde(default = "default_restitution")]
    pub restitution: f32,
    #[serde(default = "default_friction")]
    pub friction: f32,
    #[serde(default = "default_solver_iterations")]
    pub solver_iterations: usize,
    #[serde(default)]
    pub linear_damping: f32,
    #[serde(default)]
    pub angular_damping: f32,
    #[serde(default)]
    pub sleep: SleepConfig,
    #[serde(default)]
    pub clustering: ClusteringConfig,
    #[serde(default)]
    pub threading: ThreadingConfig,
    /// Capture history from construction when present
    #[serde(default)]
    pub rewind: Option<RewindConfig>,
    #[serde(default)]
    pub collision_filter: EventFilter,
    #[serde(default)]
    pub breaking_filter: EventFilter,
}

fn default_gravity() -> Vec3 {
    Vec3::new(0.0, GRAVITY, 0.0)
}
fn default_floor_height() -> Option<f32> {
    Some(0.0)
}
fn default_restitution() -> f32 {
    RESTITUTION
}
fn default_friction() -> f32 {
    FRICTION
}
fn default_solver_iterations() -> usize {
    SOLVER_ITERATIONS
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            gravity: default_gravity(),
            floor_height: default_floor_height(),
            restitution: default_restitution(),
            friction: default_friction(),
            solver_iterations: default_solver_iterations(),
            linear_damping: 0.0,
            angular_damping: 0.0,
            sleep: SleepConfig::default(),
            clustering: ClusteringConfig::default(),
            threading: ThreadingConfig::default(),
            rewind: None,
            collision_filter: EventFilter::default(),
            breaking_filter: EventFilter::default(),
        }
    }
}

impl SolverConfig {
    pub fn with_threading(mut self, mode: ThreadingMode) -> Self {
        self.threading.mode = mode;
        self
    }

    pub fn with_rewind(mut self, capacity: usize, use_resim_optimization: bool) -> Self {
        self.rewind = Some(RewindConfig {
            capacity,
            use_resim_optimization,
            ..RewindConfig::default()
        });
        self
    }

    /// Save configuration to JSON file
    pub fn save_json(&self, path: &std::path::Path) -> Result<(), Box<dyn std::error::Error>> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load configuration from JSON file
    pub fn load_json(path: &std::path::Path) -> Result<Self, Box<dyn std::error::Error>> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn save_yaml(&self, path: &std::path::Path) -> Result<(), Box<dyn std::error::Error>> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Load configuration from YAML file
    pub fn load_yaml(path: &std::path::Path) -> Result<Self, Box<dyn std::error::Error>> {
        let yaml = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&yaml)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SolverConfig =
            serde_json::from_str(r#"{ "restitution": 0.5, "rewind": { "capacity": 8 } }"#).unwrap();
        assert_eq!(config.restitution, 0.5);
        assert_eq!(config.floor_height, Some(0.0));
        assert_eq!(config.solver_iterations, SOLVER_ITERATIONS);
        let rewind = config.rewind.unwrap();
        assert_eq!(rewind.capacity, 8);
        assert!(rewind.use_resim_optimization);
    }

    #[test]
    fn test_yaml_file_round_trip() {
        let path = std::env::temp_dir().join(format!("fracture3d_config_{}.yaml", std::process::id()));
        let config = SolverConfig::default()
            .with_threading(ThreadingMode::TaskGraph)
            .with_rewind(32, false);
        config.save_yaml(&path).unwrap();
        let loaded = SolverConfig::load_yaml(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file_is_error() {
        let path = std::path::Path::new("/nonexistent/fracture3d/config.json");
        assert!(SolverConfig::load_json(path).is_err());
    }
}
