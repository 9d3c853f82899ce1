//! Navigation executable entry point.
//!
//! Flies a waypoint mission with the waypoint controller against a
//! simulated vehicle over synthetic terrain, archiving the controller's
//! targets and status to the session directory.
//!
//! # Usage
//!
//! With no arguments the mission is loaded from `nav_exec.toml` in the
//! parameters directory, otherwise the single argument is the path of the
//! mission parameters file to use.

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

mod mission;

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use color_eyre::{Report, eyre::{WrapErr, eyre}};
use log::{debug, info, warn};
use nalgebra::Vector3;
use std::env;

// Internal
use mission::{Mission, NavExecParams};
use nav_lib::{
    location::{AltFrame, FlatEarthFrame, Location},
    kinematics::ne,
    sim::{ManualClock, PerlinTerrain, SimPosControl},
    wp_nav::{WpNav, WpNavParams},
};
use util::{
    archive::Archived,
    logger::{logger_init_with_targets, LevelFilter},
    session::Session,
    time::seconds_to_millis,
};

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

/// Executable main function, entry point.
fn main() -> Result<(), Report> {
    color_eyre::install()?;

    // ---- EARLY INITIALISATION ----

    // Initialise session
    let session = Session::new(
        "nav_exec",
        "sessions"
    ).wrap_err("Failed to create the session")?;

    // Initialise logger, keeping the per-cycle trace of the control loop out
    // of the log
    logger_init_with_targets(
        LevelFilter::Trace,
        &[
            ("nav_lib::leg_mgr", LevelFilter::Debug),
            ("nav_lib::track_adv", LevelFilter::Debug),
            ("nav_lib::terrain", LevelFilter::Debug),
        ],
        &session
    ).wrap_err("Failed to initialise logging")?;

    info!("Navigation Executable\n");
    info!("Session directory: {:?}\n", session.session_root);

    // ---- LOAD PARAMETERS ----

    let args: Vec<String> = env::args().collect();
    debug!("CLI arguments: {:?}", args);

    let exec_params: NavExecParams = match args.len() {
        1 => util::params::load("nav_exec.toml")
            .wrap_err("Could not load exec params")?,
        2 => util::params::load_from_path(&args[1])
            .wrap_err_with(|| format!("Could not load exec params from \"{}\"", args[1]))?,
        n => return Err(eyre!("Expected either zero or one argument, found {}", n - 1)),
    };

    let wp_nav_params: WpNavParams = util::params::load("wp_nav.toml")
        .wrap_err("Could not load WpNav params")?;

    info!(
        "Mission of {} waypoints loaded, cycle period {:.3} s",
        exec_params.waypoints.len(),
        exec_params.cycle_period_s
    );

    if exec_params.cycle_period_s <= 0.0 {
        return Err(eyre!(
            "The cycle period must be positive, found {} s",
            exec_params.cycle_period_s
        ));
    }

    // ---- INITIALISE SIMULATION ----

    let frame = FlatEarthFrame::with_origin(
        Location::new(
            exec_params.origin_lat_deg,
            exec_params.origin_lon_deg,
            exec_params.origin_alt_cm,
            AltFrame::Absolute
        ),
        0.0
    );
    let clock = ManualClock::new(0);
    let terrain = PerlinTerrain::new(exec_params.terrain.clone());
    let mut sim = SimPosControl::new(
        Vector3::from(exec_params.start_neu_cm),
        exec_params.cycle_period_s,
        exec_params.pos_ne_p
    );

    // ---- INITIALISE MODULES ----

    info!("Initialising modules...");

    let mut wp_nav = WpNav::new(wp_nav_params, &mut sim, Some(&terrain), &frame, &clock);
    wp_nav.init_archives(&session)
        .wrap_err("Failed to initialise the WpNav archives")?;
    wp_nav.wp_and_spline_init_cm(0.0, None);
    info!("WpNav init complete");

    let mut mission = Mission::new(exec_params.waypoints.clone());
    mission.start(&mut wp_nav)
        .wrap_err("Failed to start the mission")?;

    info!("Module initialisation complete\n");

    // ---- MAIN LOOP ----

    let cycle_period_ms = seconds_to_millis(exec_params.cycle_period_s).max(1);
    let max_cycles = (exec_params.max_duration_s / exec_params.cycle_period_s).ceil() as u64;
    let mut num_cycles: u64 = 0;

    info!("Beginning main loop\n");

    while !mission.complete() && num_cycles < max_cycles {
        clock.advance_ms(cycle_period_ms);

        // ---- SENSING ----

        if exec_params.rangefinder_enabled {
            let pos = wp_nav.pos_control().pos_estimate_neu_cm();
            let height_cm = terrain.height_cm(&ne(&pos));
            let healthy = pos.z - height_cm < exec_params.rangefinder_max_cm;

            wp_nav.set_rangefinder_terrain_offset_cm(true, healthy, height_cm);
        }

        // ---- NAVIGATION ----

        let report = wp_nav.update_wpnav()
            .wrap_err("Waypoint navigation update failed")?;

        mission.update(&mut wp_nav, &report)
            .wrap_err_with(|| format!("Failed to fly waypoint {}", mission.current()))?;

        // ---- ARCHIVING ----

        wp_nav.write()
            .wrap_err("Failed to archive WpNav data")?;

        num_cycles += 1;
    }

    // ---- SUMMARY ----

    let elapsed_s = num_cycles as f64 * exec_params.cycle_period_s;
    let pos = wp_nav.pos_control().pos_estimate_neu_cm();

    if mission.complete() {
        info!("Mission complete after {:.2} s, vehicle at {:?}", elapsed_s, pos);
    }
    else {
        warn!(
            "Mission incomplete after {:.2} s, flying to waypoint {}, vehicle at {:?}",
            elapsed_s,
            mission.current(),
            pos
        );
    }

    info!("End of execution");

    Ok(())
}
