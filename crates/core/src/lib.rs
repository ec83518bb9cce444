pub mod descriptor;
pub mod detect;
pub mod device;
pub mod duplication;
pub mod error;
pub mod events;
pub mod fileops;
pub mod integrity;
pub mod logical;
pub mod manager;
pub mod paths;
pub mod physical;
pub mod pool;
pub mod rebalance;
pub mod repair;
pub mod units;
pub mod volume;

pub use descriptor::{VolumeDescriptor, DESCRIPTOR_SUFFIX};
pub use detect::PoolDetector;
pub use device::{DiskSpace, FreeSpaceProbe, MountEnumerator, StaticMounts, SysinfoDisks};
pub use error::{PoolError, PoolResult};
pub use events::{
    CancelFlag, CollectingSink, EngineEvent, EngineOperation, EngineSink, NoopSink, TracingSink,
};
pub use integrity::{
    check, check_file, repair, repair_all, CheckOptions, IntegrityIssue, IntegrityReport,
    IssueKind, RepairOptions, RepairSummary,
};
pub use logical::{FileLocation, LogicalFile, LogicalFolder, LogicalItem, LogicalItems};
pub use manager::{
    PoolManager, RemovalSpaceCheck, RemoveDriveOptions, RemoveDriveReport, ReplaceDriveOptions,
};
pub use paths::{DrivePath, FolderPath, PoolName};
pub use physical::{PhysicalFile, PhysicalFolder, PhysicalItem};
pub use pool::{Pool, PoolSpace};
pub use rebalance::{RebalanceReport, MIN_DIFF, MIN_FILE};
pub use repair::FixReport;
pub use units::{ByteSize, DuplicationLevel};
pub use volume::{Volume, SHADOW_DIR_NAME, TEMP_SUFFIX};
