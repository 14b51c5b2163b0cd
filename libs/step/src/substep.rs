use serde::{Deserialize, Serialize};

/// The operator-facing commands that drive an upgrade, plus the data migration script
/// workflow which reuses the same step machinery.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Phase {
    Initialize,
    Execute,
    Finalize,
    Revert,
    Generate,
    Apply,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Substep {
    // initialize
    SavingSourceClusterConfig,
    VerifyGpupgradeIsInstalledAcrossAllHosts,
    StartHub,
    StartAgents,
    CheckEnvironment,
    CreateBackupdirs,
    CheckDiskSpace,
    GenerateTargetConfig,
    InitTargetCluster,
    SettingDynamicLibraryPathOnTargetCluster,
    ShutdownTargetCluster,
    BackupTargetMaster,
    InitializeWaitForClusterToBeReady,
    CheckUpgrade,

    // execute
    CheckActiveConnectionsOnSourceCluster,
    ShutdownSourceCluster,
    UpgradeMaster,
    CopyMaster,
    UpgradePrimaries,
    StartTargetCluster,

    // finalize
    EnsureGpupgradeAgentsAreRunning,
    CheckActiveConnectionsOnTargetCluster,
    UpgradeMirrors,
    UpgradeStandby,
    WaitForClusterToBeReadyAfterAddingMirrorsAndStandby,
    UpdateTargetCatalog,
    UpdateDataDirectories,
    UpdateTargetConfFiles,
    WaitForClusterToBeReadyAfterUpdatingCatalog,
    ArchiveLogDirectories,
    DeleteBackupdir,
    DeleteSegmentStatedirs,
    StopHubAndAgents,
    DeleteMasterStatedir,

    // revert
    DeleteTargetClusterDatadirs,
    DeleteTablespaces,
    RestorePgcontrol,
    RestoreSourceCluster,
    StartSourceCluster,
    RecoversegSourceCluster,

    // data migration scripts
    GenerateDataMigrationScripts,
    ApplyDataMigrationScripts,
}

impl Substep {
    /// The line shown on the console while the substep runs.
    pub fn description(&self) -> &'static str {
        use Substep::*;
        match self {
            SavingSourceClusterConfig => "Saving source cluster configuration...",
            VerifyGpupgradeIsInstalledAcrossAllHosts => {
                "Verifying gpupgrade is installed across all hosts..."
            }
            StartHub => "Starting gpupgrade hub process...",
            StartAgents => "Starting gpupgrade agent processes...",
            CheckEnvironment => "Checking environment...",
            CreateBackupdirs => "Creating backup directories...",
            CheckDiskSpace => "Checking disk space...",
            GenerateTargetConfig => "Generating intermediate cluster configuration...",
            InitTargetCluster => "Creating intermediate cluster...",
            SettingDynamicLibraryPathOnTargetCluster => {
                "Setting dynamic library path on intermediate cluster..."
            }
            ShutdownTargetCluster => "Stopping intermediate cluster...",
            BackupTargetMaster => "Backing up intermediate coordinator...",
            InitializeWaitForClusterToBeReady => "Waiting for cluster to be ready...",
            CheckUpgrade => "Running pg_upgrade checks...",
            CheckActiveConnectionsOnSourceCluster => {
                "Checking active connections on source cluster..."
            }
            ShutdownSourceCluster => "Stopping source cluster...",
            UpgradeMaster => "Upgrading coordinator...",
            CopyMaster => "Copying coordinator data directory to segment hosts...",
            UpgradePrimaries => "Upgrading primary segments...",
            StartTargetCluster => "Starting intermediate cluster...",
            EnsureGpupgradeAgentsAreRunning => "Ensuring gpupgrade agent processes are running...",
            CheckActiveConnectionsOnTargetCluster => {
                "Checking active connections on target cluster..."
            }
            UpgradeMirrors => "Upgrading mirror segments...",
            UpgradeStandby => "Upgrading standby coordinator...",
            WaitForClusterToBeReadyAfterAddingMirrorsAndStandby => {
                "Waiting for cluster to be ready..."
            }
            UpdateTargetCatalog => "Updating target cluster catalog...",
            UpdateDataDirectories => "Renaming data directories...",
            UpdateTargetConfFiles => "Updating target cluster configuration files...",
            WaitForClusterToBeReadyAfterUpdatingCatalog => "Waiting for cluster to be ready...",
            ArchiveLogDirectories => "Archiving log directories...",
            DeleteBackupdir => "Deleting backup directories...",
            DeleteSegmentStatedirs => "Deleting state directories on segment hosts...",
            StopHubAndAgents => "Stopping hub and agent processes...",
            DeleteMasterStatedir => "Deleting state directory on the coordinator...",
            DeleteTargetClusterDatadirs => "Deleting target cluster data directories...",
            DeleteTablespaces => "Deleting target cluster tablespaces...",
            RestorePgcontrol => "Restoring pg_control in source cluster...",
            RestoreSourceCluster => "Restoring source cluster...",
            StartSourceCluster => "Starting source cluster...",
            RecoversegSourceCluster => "Running gprecoverseg on source cluster...",
            GenerateDataMigrationScripts => "Generating data migration SQL scripts...",
            ApplyDataMigrationScripts => "Applying data migration SQL scripts...",
        }
    }
}
