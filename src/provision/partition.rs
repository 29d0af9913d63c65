use std::path::Path;

use anyhow::{anyhow, bail, Context as _, Result};
use strum::AsRefStr;

use crate::{
    error::{Classify as _, FailureClass},
    fs::poll::{poll_until, PollOutcome, PollPolicy},
    system::{Invocation, System, SystemExt as _},
    types::{ByteSize, KIB},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "kebab-case")]
pub enum PartitionRole {
    Boot,
    Payload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionSize {
    Fixed(ByteSize),
    /// Everything left after the entries before it.
    Remainder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub role: PartitionRole,
    pub size: PartitionSize,
    /// GPT type code as understood by sgdisk, e.g. `ef00`.
    pub type_code: String,
    pub label: String,
}

/// Partitions in on-disk order. At most one entry takes the remaining space and it must be last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    entries: Vec<PartitionEntry>,
}

pub const EFI_SYSTEM_TYPE: &str = "ef00";
pub const LINUX_LUKS_TYPE: &str = "8309";

impl PartitionPlan {
    pub fn new(entries: Vec<PartitionEntry>) -> Result<Self> {
        Self::check(&entries).classify(FailureClass::Configuration)?;
        Ok(Self { entries })
    }

    fn check(entries: &[PartitionEntry]) -> Result<()> {
        if entries.is_empty() {
            bail!("Partition plan is empty");
        }
        for (i, entry) in entries.iter().enumerate() {
            match entry.size {
                PartitionSize::Remainder if i + 1 != entries.len() => bail!(
                    "Only the last partition may take the remaining space, but {} does",
                    entry.role.as_ref()
                ),
                PartitionSize::Fixed(size) if size.bytes() < KIB => {
                    bail!("Partition {} is too small: {size}", entry.role.as_ref())
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// An EFI system partition of `boot_size` followed by the encrypted payload.
    pub fn standard(boot_size: ByteSize) -> Result<Self> {
        Self::new(vec![
            PartitionEntry {
                role: PartitionRole::Boot,
                size: PartitionSize::Fixed(boot_size),
                type_code: EFI_SYSTEM_TYPE.to_owned(),
                label: "EFI".to_owned(),
            },
            PartitionEntry {
                role: PartitionRole::Payload,
                size: PartitionSize::Remainder,
                type_code: LINUX_LUKS_TYPE.to_owned(),
                label: "cryptroot".to_owned(),
            },
        ])
    }

    pub fn entries(&self) -> &[PartitionEntry] {
        &self.entries
    }
}

/// Remove every filesystem signature and both GPT copies from `disk`.
pub async fn wipe_table(system: &dyn System, disk: &Path) -> Result<()> {
    system
        .run(Invocation::new("wipefs").args(["--all", "--force"]).arg(disk))
        .await
        .with_context(|| format!("Failed to wipe signatures on {disk:?}"))?;
    system
        .run(Invocation::new("sgdisk").arg("--zap-all").arg(disk))
        .await
        .with_context(|| format!("Failed to zap partition table on {disk:?}"))?;
    Ok(())
}

pub async fn create_plan(system: &dyn System, disk: &Path, plan: &PartitionPlan) -> Result<()> {
    let mut invocation = Invocation::new("sgdisk");
    for (i, entry) in plan.entries().iter().enumerate() {
        let index = i + 1;
        let end = match entry.size {
            PartitionSize::Fixed(size) => format!("+{}K", size.bytes().div_ceil(KIB)),
            PartitionSize::Remainder => "0".to_owned(),
        };
        invocation = invocation
            .arg(format!("--new={index}:0:{end}"))
            .arg(format!("--typecode={index}:{}", entry.type_code))
            .arg(format!("--change-name={index}:{}", entry.label));
    }
    system
        .run(invocation.arg(disk))
        .await
        .with_context(|| format!("Failed to create partitions on {disk:?}"))?;

    // udev usually picks the new table up on its own.
    system
        .run_best_effort(Invocation::new("partprobe").arg(disk))
        .await;
    Ok(())
}

/// Wait until every node in `paths` exists, settling udev once before giving up.
pub async fn wait_for_nodes(system: &dyn System, paths: &[&Path], policy: PollPolicy) -> Result<()> {
    let all_exist = || paths.iter().all(|path| system.exists(path));

    let outcome = poll_until(policy, system, &all_exist).await;
    if let PollOutcome::Ready { attempts } = outcome {
        tracing::debug!(attempts, "Partition device nodes are ready");
        return Ok(());
    }

    tracing::debug!("Partition device nodes still missing, settling udev");
    system
        .run_best_effort(Invocation::new("udevadm").arg("settle"))
        .await;
    if all_exist() {
        return Ok(());
    }

    let missing = paths
        .iter()
        .filter(|path| !system.exists(path))
        .collect::<Vec<_>>();
    Err(anyhow!(
        "Device nodes {missing:?} did not appear within {:?}",
        policy.budget()
    )
    .context(FailureClass::Provisioning))
}

#[cfg(test)]
pub mod tests {

    #[allow(unused_imports)]
    use super::*;
    use crate::{error::failure_class_of, system::fake::FakeSystem};
    use std::time::Duration;

    const NODES: [&str; 2] = ["/dev/exampleN1p1", "/dev/exampleN1p2"];

    fn nodes() -> Vec<&'static Path> {
        NODES.iter().map(Path::new).collect()
    }

    #[test]
    fn test_remainder_must_be_last() {
        let payload = PartitionEntry {
            role: PartitionRole::Payload,
            size: PartitionSize::Remainder,
            type_code: LINUX_LUKS_TYPE.to_owned(),
            label: "cryptroot".to_owned(),
        };
        let boot = PartitionEntry {
            role: PartitionRole::Boot,
            size: PartitionSize::Fixed(ByteSize::gib(1)),
            type_code: EFI_SYSTEM_TYPE.to_owned(),
            label: "EFI".to_owned(),
        };
        let error = PartitionPlan::new(vec![payload.clone(), boot.clone()]).unwrap_err();
        assert_eq!(failure_class_of(&error), Some(FailureClass::Configuration));
        assert!(PartitionPlan::new(vec![payload.clone(), payload.clone()]).is_err());
        assert!(PartitionPlan::new(vec![]).is_err());
        assert!(PartitionPlan::new(vec![boot, payload]).is_ok());
    }

    #[tokio::test]
    async fn test_create_standard_plan() -> Result<()> {
        let system = FakeSystem::new();
        let disk = Path::new("/dev/exampleN1");
        wipe_table(&system, disk).await?;
        create_plan(&system, disk, &PartitionPlan::standard(ByteSize::gib(1))?).await?;
        assert_eq!(
            system.commands(),
            vec![
                "wipefs --all --force /dev/exampleN1",
                "sgdisk --zap-all /dev/exampleN1",
                "sgdisk --new=1:0:+1048576K --typecode=1:ef00 --change-name=1:EFI \
                 --new=2:0:0 --typecode=2:8309 --change-name=2:cryptroot /dev/exampleN1",
                "partprobe /dev/exampleN1",
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_partprobe_failure_is_tolerated() -> Result<()> {
        let system = FakeSystem::new();
        system.fail("partprobe");
        create_plan(
            &system,
            Path::new("/dev/sda"),
            &PartitionPlan::standard(ByteSize::mib(512))?,
        )
        .await
    }

    #[tokio::test]
    async fn test_nodes_ready_within_budget() -> Result<()> {
        let system = FakeSystem::new();
        system.appear_after(NODES[0], 3);
        system.appear_after(NODES[1], 7);

        wait_for_nodes(&system, &nodes(), PollPolicy::DEVICE_NODES).await?;

        assert!(!system.ran("udevadm settle"));
        assert!(system.sleeps().len() < PollPolicy::DEVICE_NODES.max_attempts as usize);
        Ok(())
    }

    #[tokio::test]
    async fn test_nodes_never_appear() {
        let system = FakeSystem::new();
        let policy = PollPolicy::DEVICE_NODES;
        system.appear_after(NODES[0], 0);
        system.appear_after(NODES[1], 10 * policy.max_attempts as usize);

        let error = wait_for_nodes(&system, &nodes(), policy).await.unwrap_err();

        assert_eq!(failure_class_of(&error), Some(FailureClass::Provisioning));
        assert!(system.ran("udevadm settle"));
        assert_eq!(
            system.sleeps(),
            vec![Duration::from_millis(200); policy.max_attempts as usize - 1]
        );
    }

    #[tokio::test]
    async fn test_nodes_appear_after_settle() -> Result<()> {
        let system = FakeSystem::new();
        let policy = PollPolicy {
            interval: Duration::from_millis(200),
            max_attempts: 5,
        };
        system.appear_after(NODES[0], 0);
        system.appear_after(NODES[1], 5);

        wait_for_nodes(&system, &nodes(), policy).await?;
        assert!(system.ran("udevadm settle"));
        Ok(())
    }
}
