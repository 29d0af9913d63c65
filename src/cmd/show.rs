use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::*;

use crate::{
    config::{
        source::{load_config, ConfigSource},
        InstallConfig,
    },
    provision::{
        filesystem::{mount_order, Subvolume, BOOT_MOUNT_OPTIONS, BOOT_MOUNT_POINT, SUBVOLUME_LAYOUT},
        naming::DeviceNameSet,
        outcome::Degradation,
        partition::{PartitionPlan, PartitionRole, PartitionSize},
    },
    system::{host::HostSystem, in_root, System},
};

pub struct ShowCommand {
    pub sources: Vec<Box<dyn ConfigSource>>,
}

#[async_trait]
impl crate::cmd::Command for ShowCommand {
    async fn run(&self) -> Result<()> {
        let config = load_config(&self.sources).await?;
        let names = DeviceNameSet::resolve(&config.disk)?;
        print_plan(&HostSystem, &config, &names)
    }
}

fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

pub fn partition_table(system: &dyn System, names: &DeviceNameSet, plan: &PartitionPlan) -> Table {
    let mut table = new_table();
    table.set_header(vec!["#", "Device", "Role", "Size", "Type Code", "Label"]);

    for (i, entry) in plan.entries().iter().enumerate() {
        let device = match entry.role {
            PartitionRole::Boot => &names.boot,
            PartitionRole::Payload => &names.payload,
        };
        table.add_row(vec![
            Cell::new(i + 1),
            if system.exists(device) {
                Cell::new(format!("{} <exists>", device.display())).fg(Color::Yellow)
            } else {
                Cell::new(device.display())
            },
            Cell::new(entry.role.as_ref()),
            match entry.size {
                PartitionSize::Fixed(size) => Cell::new(size),
                PartitionSize::Remainder => Cell::new("<remaining>").fg(Color::DarkGrey),
            },
            Cell::new(&entry.type_code),
            Cell::new(&entry.label),
        ]);
    }
    table
}

pub fn layout_table(layout: &[Subvolume]) -> Table {
    let mut table = new_table();
    table.set_header(vec!["Subvolume", "Role", "Mount Point", "Mount Options"]);
    for subvolume in layout {
        table.add_row(vec![
            Cell::new(subvolume.name),
            Cell::new(subvolume.role.as_ref()),
            Cell::new(subvolume.mount_point),
            Cell::new(subvolume.mount_options()),
        ]);
    }
    table
}

/// The mounts in the order they are made, the boot partition last.
pub fn mount_order_table(root: &Path, mapped_name: &str, names: &DeviceNameSet) -> Table {
    let mut table = new_table();
    table.set_header(vec!["Order", "Target", "Source"]);

    let ordered = mount_order(&SUBVOLUME_LAYOUT);
    for (i, subvolume) in ordered.iter().enumerate() {
        table.add_row(vec![
            Cell::new(i + 1),
            Cell::new(in_root(root, subvolume.mount_point).display()),
            Cell::new(format!("/dev/mapper/{mapped_name} [{}]", subvolume.name)),
        ]);
    }
    table.add_row(vec![
        Cell::new(ordered.len() + 1),
        Cell::new(in_root(root, BOOT_MOUNT_POINT).display()),
        Cell::new(format!("{} [{BOOT_MOUNT_OPTIONS}]", names.boot.display())),
    ]);
    table
}

pub fn degradation_table(degradations: &[&Degradation]) -> Table {
    let mut table = new_table();
    table.set_header(vec!["Component", "Failure", "Exit Code", "Detail", "Transcript"]);
    for degradation in degradations {
        table.add_row(vec![
            Cell::new(degradation.component),
            Cell::new(degradation.class).fg(Color::Yellow),
            Cell::new(degradation.class.exit_code()),
            Cell::new(&degradation.detail),
            match &degradation.transcript {
                Some(transcript) => Cell::new(transcript.display()),
                None => Cell::new("<not saved>").fg(Color::DarkGrey),
            },
        ]);
    }
    table
}

pub fn print_plan(system: &dyn System, config: &InstallConfig, names: &DeviceNameSet) -> Result<()> {
    let plan = PartitionPlan::standard(config.boot_size)?;

    println!("Partitions of {}:", config.disk.display());
    println!("{}", partition_table(system, names, &plan));
    println!("Subvolumes of /dev/mapper/{}:", config.mapped_name);
    println!("{}", layout_table(&SUBVOLUME_LAYOUT));
    println!("Mount order below {}:", config.target_root.display());
    println!(
        "{}",
        mount_order_table(&config.target_root, &config.mapped_name, names)
    );
    Ok(())
}
