pub mod config;
pub mod container;
pub mod deploy;
pub mod error;
pub mod message;
pub mod node;
pub mod pod;
pub mod resource;
pub mod telemetry;

pub use config::{Config, DockerConfig, EtcdConfig, GitConfig, SchedulerConfig, SyslogConfig};
pub use container::{Container, ContainerStatus};
pub use deploy::{DeployMethod, DeployOptions, Entrypoint, HealthCheck, Hook, VolumeBinding};
pub use error::{ArmadaError, Result};
pub use message::{
    BuildImageMessage, CreateContainerMessage, RemoveContainerMessage, ReplaceContainerMessage,
    SendFileMessage,
};
pub use node::Node;
pub use pod::{Pod, SchedulerMode};
pub use resource::{CpuMap, ResourceDelta, ResourceOp, VolumeMap, MIN_MEMORY, SHARE_BASE};
