//! The 4CT experiment runner: loads an experiment, connects to the perch
//! controller (or a simulated one) and hands control to the operator.

mod headless;

use clap::Parser;
use fourct::{
    args::FourCtArgs,
    config::ExperimentConfig,
    dummy_controller::DummyController,
    export::{export, ExportError},
    gui::{monitor, port_selector},
    playback::{ClipTimer, Playback},
    run_controller::{RunController, RunState},
    serial_link::{available_ports, LinkHandle},
};

use log::{error, info, warn};
use std::{error::Error, path::Path, process::ExitCode, sync::Arc, time::Duration};

fn main() -> ExitCode {
    env_logger::init();
    let args = FourCtArgs::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("fourct: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: FourCtArgs) -> Result<(), Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => ExperimentConfig::from_path(path)?,
        None => {
            info!("No configuration given, using defaults");
            ExperimentConfig::default()
        }
    };
    if let Some(baud) = args.baud {
        config.serial.baud_rate = baud;
    }
    if let Some(port) = &args.port {
        config.serial.ports = vec![port.clone()];
    }
    for warning in config.validate()? {
        warn!("Configuration: {warning}");
    }

    let (link, events) = if args.simulate {
        info!("Using a simulated perch controller");
        let controller = DummyController::simulated(Duration::from_millis(args.sim_interval_ms));
        LinkHandle::spawn(controller, config.link_settings())
    } else {
        if args.choose_port {
            match port_selector(available_ports()?)? {
                Some(port) => config.serial.ports = vec![port],
                None => return Ok(()),
            }
        }
        // Without a controller there is no experiment; the operator has to
        // fix the cabling and start again.
        LinkHandle::open(
            &config.serial.ports,
            config.serial.baud_rate,
            Duration::from_millis(config.serial.settle_ms),
            config.link_settings(),
        )?
    };

    let run = RunController::new(
        config.run_settings(),
        link,
        events,
        config.schedule()?,
        config.library(),
        player(args.simulate)?,
    );

    let surface = if args.headless {
        headless::headless(&run).map_err(Box::<dyn Error>::from)
    } else {
        monitor(&run).map_err(Box::<dyn Error>::from)
    };

    let stem = format!("{}_{}", config.experiment, config.subject);
    finish(run, args.export.as_deref().map(|dir| (dir, stem.as_str())))?;
    surface
}

/// Stop what is still running, export the results if asked to and shut the
/// run down. The run is shut down even when the export fails.
fn finish(run: RunController, export_to: Option<(&Path, &str)>) -> Result<(), ExportError> {
    if matches!(run.state(), RunState::Running | RunState::Paused) {
        if let Err(e) = run.stop() {
            error!("Could not stop the run: {e}");
        }
    }
    let exported = match export_to {
        Some((dir, stem)) => export(dir, stem, &run.log(), &run.snapshots()).map(|_| ()),
        None => Ok(()),
    };
    if let Err(e) = &exported {
        error!("Could not export the results: {e}");
    }
    run.shutdown();
    exported
}

#[cfg(feature = "audio")]
fn player(simulate: bool) -> Result<Arc<dyn Playback>, Box<dyn Error>> {
    if simulate {
        return Ok(Arc::new(ClipTimer));
    }
    Ok(Arc::new(fourct::playback::CpalPlayer::new()?))
}

#[cfg(not(feature = "audio"))]
fn player(_simulate: bool) -> Result<Arc<dyn Playback>, Box<dyn Error>> {
    warn!("Built without the audio feature, clips are timed but not heard");
    Ok(Arc::new(ClipTimer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fourct::{
        rotation::Rotation, run_controller::RunSettings, schedule::ScheduleTable,
        serial_link::LinkSettings, stimulus::StimulusLibrary,
    };
    use std::fs;

    fn run_on(controller: DummyController) -> (LinkHandle, RunController) {
        let (link, events) = LinkHandle::spawn(controller, LinkSettings::default());
        let run = RunController::new(
            RunSettings::default(),
            link.clone(),
            events,
            ScheduleTable::all_day(Rotation::IDENTITY),
            StimulusLibrary::new(),
            Arc::new(ClipTimer),
        );
        (link, run)
    }

    #[test]
    fn a_failed_export_still_shuts_the_run_down() {
        let dir = tempfile::tempdir().unwrap();
        // a file where the export directory should go
        let blocked = dir.path().join("exports");
        fs::write(&blocked, "not a directory").unwrap();

        let (link, run) = run_on(DummyController::new());
        run.start().unwrap();
        let result = finish(run, Some((blocked.as_path(), "pilot_Zebra finch")));

        assert!(matches!(result, Err(ExportError::Io(_))));
        assert!(link.is_closed());
    }

    #[test]
    fn finishing_exports_and_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("exports");

        let (link, run) = run_on(DummyController::new());
        run.start().unwrap();
        finish(run, Some((out.as_path(), "pilot"))).unwrap();

        assert!(out.join("pilot_log.txt").is_file());
        assert!(link.is_closed());
    }
}
