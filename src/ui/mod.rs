use crate::actions::{ActionDesc, Symbol};
use crate::engine::{EngineCommand, EngineHandle, EngineUpdate, TrackUiState};
use crate::session::Session;
use crate::track::TrackMode;
use eframe::egui;
use std::path::PathBuf;

pub struct OstinatoApp {
    engine: EngineHandle,
    session: Option<Session>,
    session_path: Option<PathBuf>,
    error_message: Option<String>,
    running: bool,
    tempo: f32,
}

impl OstinatoApp {
    pub fn new(engine: EngineHandle) -> Self {
        Self {
            engine,
            session: None,
            session_path: None,
            error_message: None,
            running: false,
            tempo: 120.0,
        }
    }

    fn process_engine_updates(&mut self) {
        while let Ok(update) = self.engine.update_rx.try_recv() {
            match update {
                EngineUpdate::SessionLoaded { session } => {
                    self.tempo = session.tempo;
                    self.session = Some(session);
                    self.error_message = None;
                }
                EngineUpdate::EngineState { running } => {
                    self.running = running;
                }
                EngineUpdate::Error { message } => {
                    self.error_message = Some(message);
                }
            }
        }
    }

    fn send_action(&self, track: usize, symbol: Symbol) {
        let mut desc = ActionDesc::new(symbol);
        desc.track = Some(track);
        let _ = self.engine.command_tx.send(EngineCommand::Do(desc));
    }

    fn menu_bar(&mut self, ui: &mut egui::Ui) {
        egui::MenuBar::new().ui(ui, |ui| {
            ui.menu_button("File", |ui| {
                if ui.button("New Session").clicked() {
                    let session = Session::default();
                    self.tempo = session.tempo;
                    let _ = self
                        .engine
                        .command_tx
                        .send(EngineCommand::ReloadSession(session.clone()));
                    self.session = Some(session);
                    self.session_path = None;
                    ui.close();
                }

                if ui.button("Open Session...").clicked() {
                    if let Some(path) = rfd::FileDialog::new()
                        .set_title("Open Ostinato Session")
                        .pick_folder()
                    {
                        self.session_path = Some(path.clone());
                        let _ = self
                            .engine
                            .command_tx
                            .send(EngineCommand::LoadSession(path));
                        ui.close();
                    }
                }

                if ui.button("💾 Save Session").clicked() {
                    if let (Some(session), Some(path)) = (&self.session, &self.session_path) {
                        if let Err(e) = session.save(path) {
                            self.error_message = Some(format!("Failed to save session: {}", e));
                        }
                    } else if let Some(session) = &self.session {
                        if let Some(path) = rfd::FileDialog::new()
                            .set_title("Save Ostinato Session")
                            .pick_folder()
                        {
                            if let Err(e) = session.save(&path) {
                                self.error_message =
                                    Some(format!("Failed to save session: {}", e));
                            } else {
                                self.session_path = Some(path);
                            }
                        }
                    }
                    ui.close();
                }

                ui.separator();

                if ui.button("Quit").clicked() {
                    std::process::exit(0);
                }
            });
        });
    }

    fn transport_controls(&mut self, ui: &mut egui::Ui, transport_running: bool, beat: u64) {
        ui.horizontal(|ui| {
            if self.running {
                if ui.button("⏹ Stop Engine").clicked() {
                    let _ = self.engine.command_tx.send(EngineCommand::Stop);
                }
            } else if ui.button("▶ Start Engine").clicked() {
                let _ = self.engine.command_tx.send(EngineCommand::Start);
            }

            if transport_running {
                if ui.button("⏸ Transport").clicked() {
                    let _ = self.engine.command_tx.send(EngineCommand::TransportStop);
                }
                ui.label(format!("beat {}", beat));
            } else if ui.button("▶ Transport").clicked() {
                let _ = self.engine.command_tx.send(EngineCommand::TransportStart);
            }

            let response = ui.add(
                egui::DragValue::new(&mut self.tempo)
                    .range(30.0..=300.0)
                    .suffix(" bpm"),
            );
            if response.changed() {
                let _ = self.engine.command_tx.send(EngineCommand::SetTempo(self.tempo));
            }
        });
    }

    fn track_strip(&self, ui: &mut egui::Ui, state: &TrackUiState) {
        let title = if state.name.is_empty() {
            format!("Track {}", state.number + 1)
        } else {
            state.name.clone()
        };
        ui.group(|ui| {
            ui.horizontal(|ui| {
                ui.strong(title);
                ui.label(mode_label(state.mode));
                if state.overdub {
                    ui.colored_label(egui::Color32::ORANGE, "odub");
                }
                if state.mute {
                    ui.colored_label(egui::Color32::LIGHT_BLUE, "mute");
                }
                if state.reverse {
                    ui.colored_label(egui::Color32::LIGHT_GREEN, "rev");
                }
                ui.label(format!(
                    "loop {}/{}",
                    state.loop_index + 1,
                    state.loop_count
                ));
            });

            let progress = if state.loop_frames > 0 {
                state.frame as f32 / state.loop_frames as f32
            } else {
                0.0
            };
            ui.add(
                egui::ProgressBar::new(progress)
                    .text(format!("{} / {}", state.frame, state.loop_frames)),
            );

            ui.horizontal_wrapped(|ui| {
                for (label, symbol) in [
                    ("Record", Symbol::Record),
                    ("Overdub", Symbol::Overdub),
                    ("Multiply", Symbol::Multiply),
                    ("Insert", Symbol::Insert),
                    ("Replace", Symbol::Replace),
                    ("Mute", Symbol::Mute),
                    ("Pause", Symbol::Pause),
                    ("Undo", Symbol::Undo),
                    ("Redo", Symbol::Redo),
                    ("Next", Symbol::NextLoop),
                    ("Prev", Symbol::PrevLoop),
                    ("Confirm", Symbol::Confirm),
                    ("Reset", Symbol::Reset),
                ] {
                    if ui.button(label).clicked() {
                        self.send_action(state.number, symbol);
                    }
                }
            });

            if !state.events.events.is_empty() {
                ui.separator();
                for event in &state.events.events {
                    let frame = if event.pending {
                        "pending".to_string()
                    } else {
                        format!("@{}", event.frame)
                    };
                    let stacked = if event.stacked.is_empty() {
                        String::new()
                    } else {
                        format!("  [{}]", event.stacked.join(", "))
                    };
                    ui.monospace(format!("{} {}{}", event.name, frame, stacked));
                }
            }
        });
    }
}

fn mode_label(mode: TrackMode) -> &'static str {
    mode.name()
}

impl eframe::App for OstinatoApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.process_engine_updates();
        let snapshot = self.engine.snapshot.load_full();

        egui::TopBottomPanel::top("menu_bar").show(ctx, |ui| {
            self.menu_bar(ui);
        });

        if let Some(ref error) = self.error_message {
            egui::TopBottomPanel::top("error").show(ctx, |ui| {
                ui.colored_label(egui::Color32::RED, error);
            });
        }
        if !snapshot.alerts.is_empty() {
            egui::TopBottomPanel::top("alerts").show(ctx, |ui| {
                for alert in &snapshot.alerts {
                    ui.colored_label(egui::Color32::YELLOW, *alert);
                }
            });
        }

        egui::TopBottomPanel::top("transport").show(ctx, |ui| {
            self.transport_controls(ui, snapshot.transport_running, snapshot.beat);
        });

        egui::CentralPanel::default().show(ctx, |ui| {
            if snapshot.tracks.is_empty() {
                ui.vertical_centered(|ui| {
                    ui.heading("Engine stopped");
                    ui.label("▶ Start Engine to begin looping");
                });
            } else {
                egui::ScrollArea::vertical().show(ui, |ui| {
                    for state in &snapshot.tracks {
                        self.track_strip(ui, state);
                    }
                });
            }
        });

        ctx.request_repaint();
    }
}
