use std::{path::PathBuf, thread, time::Duration};

use stage_controller::{
    config::{create_default_config, init_config},
    hal::{grbl, MotionHal},
    logging,
    motion_thread::{HalBuilder, MotionThread},
};
use tracing::info;

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|val| val == "1" || val.to_lowercase() == "true")
        .unwrap_or(false)
}

fn main() -> anyhow::Result<()> {
    logging::init();

    if env_flag("CREATE_CONFIG") {
        create_default_config(None::<PathBuf>)?;
    }

    let (_config_manager, config) = init_config().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        eprintln!("Run with CREATE_CONFIG=1 to create a default configuration file.");
        e
    })?;

    let builder: HalBuilder = if env_flag("STAGE_MOCK") {
        // Scripted controller for bring-up without hardware.
        let port = ::grbl::mock::MockPort::new();
        let config = config.clone();
        Box::new(move || {
            let driver = ::grbl::Grbl::new(port.clone())?;
            Ok(Box::new(grbl::GrblHal::new(driver, &config)?) as Box<dyn MotionHal>)
        })
    } else {
        let config = config.clone();
        Box::new(move || Ok(Box::new(grbl::open_hal(&config)?) as Box<dyn MotionHal>))
    };

    let motion = MotionThread::spawn(builder, config.motion_reboot)?;

    let build = motion.raw_command("$I")?;
    info!("controller build info:\n{build}");
    info!("position: {:?}", motion.pos()?);

    while motion.is_running() {
        thread::sleep(Duration::from_secs(1));
        if let Some(pos) = motion.last_position() {
            info!("position: {pos:?}");
        }
    }
    motion.shutdown();

    Ok(())
}
