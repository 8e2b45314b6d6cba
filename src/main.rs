use ostinato::{OstinatoApp, spawn_engine};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let engine = spawn_engine();

    // Keep the MIDI connection alive for the lifetime of the app.
    let _midi = ostinato::midi::spawn_midi_input(
        engine.command_tx.clone(),
        engine.midi_clock.clone(),
    );

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([1100.0, 750.0])
            .with_title("Ostinato"),
        ..Default::default()
    };

    let _ = eframe::run_native(
        "Ostinato",
        options,
        Box::new(|_cc| Ok(Box::new(OstinatoApp::new(engine)))),
    );
}
