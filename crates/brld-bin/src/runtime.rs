//! Daemon runtime wiring.
//!
//! Construction order follows the dependency graph, leaves first: scheduler,
//! reports bus, command queue, key table, then the two supervised units.
//! The display driver and the API server are each an [`Activity`]; the
//! server's `start` fails (and retries) until the driver has produced a
//! braille session, and a device-offline report bounces both so a yanked
//! cable comes back by itself.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use core_activity::{Activity, ActivityDescriptor, ActivityMethods};
use core_api::{ApiServer, parse_host};
use core_braille::{BrailleSession, DotTable, SessionConfig, SessionTimings};
use core_commands::{Command, CommandQueue, basic, block};
use core_config::Config;
use core_keytable::{KeyTableRuntime, KeyTableTimings};
use core_reports::{ReportBus, ReportId};
use core_sched::{MonitorHandle, Scheduler};
use core_transport::{DeviceDescriptor, ResourceIdentifier, connect};
use tracing::{debug, info, warn};

use crate::keymap::default_key_table;

/// Set by the signal handler; polled by the main wait loop.
pub static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

type DisplaySlot = Rc<RefCell<Option<Rc<BrailleSession>>>>;

struct DriverMethods {
    sched: Rc<Scheduler>,
    bus: Rc<ReportBus>,
    keytable: Rc<KeyTableRuntime>,
    config: Config,
    slot: DisplaySlot,
    monitor: Option<MonitorHandle>,
}

impl ActivityMethods for DriverMethods {
    fn start(&mut self) -> bool {
        let braille = &self.config.file.braille;
        let identifier: ResourceIdentifier = match braille.device.parse() {
            Ok(identifier) => identifier,
            Err(e) => {
                warn!(target: "runtime.driver", error = %e, "bad_device_identifier");
                return false;
            }
        };
        let descriptor = DeviceDescriptor {
            baud: braille.baud,
            ..DeviceDescriptor::default()
        };
        let endpoint = match connect(&identifier, &descriptor) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                debug!(target: "runtime.driver", error = %e, "device_connect_failed");
                return false;
            }
        };

        let session = BrailleSession::new(
            Rc::clone(&self.sched),
            endpoint,
            Rc::clone(&self.keytable),
            Rc::clone(&self.bus),
            SessionConfig {
                driver_name: "generic",
                columns: 40,
                rows: 1,
                status_cells: 0,
                dot_table: DotTable::identity(),
                timings: SessionTimings {
                    ack_timeout: braille.ack_timeout(),
                    ack_limit: braille.ack_limit,
                    read_subsequent: Duration::from_millis(100),
                },
            },
        );
        self.monitor = session.register_input_monitor(&self.sched);
        *self.slot.borrow_mut() = Some(Rc::clone(&session));
        self.bus.report(&core_reports::Report::BrailleDeviceOnline {
            driver: session.driver_name(),
        });
        info!(target: "runtime.driver", device = braille.device.as_str(), "driver_started");
        true
    }

    fn stop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            self.sched.cancel_monitor(monitor);
        }
        if self.slot.borrow_mut().take().is_some() {
            info!(target: "runtime.driver", "driver_stopped");
        }
    }
}

struct ServerMethods {
    sched: Rc<Scheduler>,
    bus: Rc<ReportBus>,
    config: Config,
    slot: DisplaySlot,
    server: Option<ApiServer>,
}

impl ActivityMethods for ServerMethods {
    fn start(&mut self) -> bool {
        let Some(display) = self.slot.borrow().clone() else {
            debug!(target: "runtime.server", "waiting_for_display");
            return false;
        };
        let api = &self.config.file.api;
        let spec = match parse_host(&api.host) {
            Ok(spec) => spec,
            Err(e) => {
                warn!(target: "runtime.server", error = %e, "bad_api_host");
                return false;
            }
        };
        let server = match ApiServer::new(
            Rc::clone(&self.sched),
            display,
            Rc::clone(&self.bus),
            &api.auth,
        ) {
            Ok(server) => server,
            Err(e) => {
                warn!(target: "runtime.server", error = %e, "server_setup_failed");
                return false;
            }
        };
        if let Err(e) = server.listen(&spec) {
            warn!(target: "runtime.server", error = %e, "listen_failed");
            return false;
        }
        self.server = Some(server);
        info!(target: "runtime.server", host = api.host.as_str(), "api_server_started");
        true
    }

    fn stop(&mut self) {
        if let Some(server) = self.server.take() {
            server.shutdown();
            info!(target: "runtime.server", "api_server_stopped");
        }
    }
}

pub struct DaemonRuntime {
    sched: Rc<Scheduler>,
    shutdown: Rc<Cell<bool>>,
    driver: Activity,
    server: Activity,
}

impl DaemonRuntime {
    pub fn new(config: Config) -> Result<Self> {
        let sched = Rc::new(Scheduler::new().context("scheduler construction")?);
        let bus = Rc::new(ReportBus::new());
        let shutdown = Rc::new(Cell::new(false));

        // The console back-end is an external collaborator; the default
        // handler terminates the dispatch chain and owns daemon-level
        // commands.
        let commands = {
            let shutdown = Rc::clone(&shutdown);
            Rc::new(CommandQueue::new(Rc::clone(&bus), move |command: Command| {
                match (command.block(), command.operand()) {
                    (block::BASIC, basic::QUIT) => {
                        info!(target: "runtime", "quit_command");
                        shutdown.set(true);
                        true
                    }
                    (block::BASIC, _) | (block::ROUTE, _) => {
                        debug!(target: "runtime.console", command = command.name(), "console_command");
                        true
                    }
                    _ => false,
                }
            }))
        };

        let input = &config.file.input;
        let timings = KeyTableTimings {
            long_press: input.long_press(),
            autorepeat_interval: input.autorepeat(),
            autorelease: input.autorelease(),
            sticky_modifiers: input.sticky_timeout(),
        };
        let keytable = {
            let commands = Rc::clone(&commands);
            KeyTableRuntime::new(
                Rc::clone(&sched),
                default_key_table(),
                timings,
                move |command| commands.dispatch(command),
            )
        };
        keytable.set_keyboard_sink(|function| {
            // Console keyboard injection is an external collaborator.
            debug!(target: "runtime.console", ?function, "keyboard_event");
        });

        let slot: DisplaySlot = Rc::new(RefCell::new(None));
        let driver = Activity::new(
            Rc::clone(&sched),
            ActivityDescriptor::new("braille-driver")
                .retry_interval(config.file.braille.retry_interval()),
            DriverMethods {
                sched: Rc::clone(&sched),
                bus: Rc::clone(&bus),
                keytable: Rc::clone(&keytable),
                config: config.clone(),
                slot: Rc::clone(&slot),
                monitor: None,
            },
        );
        let server = Activity::new(
            Rc::clone(&sched),
            ActivityDescriptor::new("api-server").retry_interval(Duration::from_millis(500)),
            ServerMethods {
                sched: Rc::clone(&sched),
                bus: Rc::clone(&bus),
                config: config.clone(),
                slot: Rc::clone(&slot),
                server: None,
            },
        );

        // A dead device bounces both activities; the retry alarms bring them
        // back once the hardware answers again. Restarting from a task-like
        // alarm keeps the teardown out of the report delivery path.
        {
            let sched_for_listener = Rc::clone(&sched);
            let driver = driver.clone();
            let server = server.clone();
            bus.register_listener(ReportId::BrailleDeviceOffline, move |_| {
                let driver = driver.clone();
                let server = server.clone();
                sched_for_listener.set_alarm_in(Duration::ZERO, move |_| {
                    warn!(target: "runtime", "display_offline_restarting");
                    server.stop();
                    driver.stop();
                    driver.start();
                    server.start();
                });
            });
        }

        Ok(Self {
            sched,
            shutdown,
            driver,
            server,
        })
    }

    /// Run until a quit command or termination signal.
    pub fn run(&self) -> Result<()> {
        install_signal_handlers();
        self.driver.start();
        self.server.start();
        let shutdown = Rc::clone(&self.shutdown);
        self.sched
            .wait_for(move || shutdown.get() || SHUTDOWN_SIGNAL.load(Ordering::SeqCst));
        info!(target: "runtime", "shutting_down");
        self.server.stop();
        if self.server.await_stopped().is_err() {
            warn!(target: "runtime", "server_stop_timeout");
        }
        self.driver.stop();
        if self.driver.await_stopped().is_err() {
            warn!(target: "runtime", "driver_stop_timeout");
        }
        Ok(())
    }
}

extern "C" fn on_terminate_signal(_sig: libc::c_int) {
    SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    // Only the async-signal-safe atomic store happens in the handler.
    let handler = on_terminate_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as usize);
        libc::signal(libc::SIGTERM, handler as usize);
    }
}
