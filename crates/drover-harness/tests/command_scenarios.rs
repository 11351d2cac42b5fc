//! Conn ⇄ registrar scenarios: two loops, one packet transport pair.
//!
//! The controller side runs a loop hosting a navigation responder (and
//! the unsupported-command sweep); the operator side runs a loop hosting
//! the conn. Commands flow one way, replies and events the other, all
//! under tokio's paused clock so the expiration scenarios are exact.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use drover_core::{
    Conn, Loop, RunContext,
    conn::CommandFuture,
    error::ConnError,
    registrar::{CommandMsg, Registrar, UnsupportedCommands},
    scheduler::{self, ControlContext},
};
use drover_harness::{TELEMETRY, Telemetry, packet_pair};
use drover_proto::{
    Angle, Registry,
    messages::{CommandOk, Nav2dCaps, Nav2dCapsQuery, Nav2dDrive, Nav2dTurn},
};

fn registry() -> Arc<Registry> {
    let mut reg = Registry::builtin();
    reg.register::<Telemetry>(TELEMETRY);
    Arc::new(reg)
}

/// A loop-hosted responder answering navigation commands the way a
/// controller would.
fn nav_responder(lp: &mut Loop) {
    lp.add_controller(scheduler::CONTROL, move |cc: &mut ControlContext<'_>| {
        cc.messages().process(|mctx| {
            let handled = mctx
                .current()
                .and_then(|m| m.downcast_ref::<CommandMsg>())
                .map(|cm| {
                    cm.command.msg_as::<Nav2dCapsQuery>().is_some()
                        || cm.command.msg_as::<Nav2dDrive>().is_some()
                })
                .unwrap_or(false);
            if !handled {
                return;
            }
            let cmd = mctx.take_as::<CommandMsg>().expect("checked above").command;
            if cmd.msg_as::<Nav2dCapsQuery>().is_some() {
                let caps = Nav2dCaps { drive_speed_max: 350.0, turn_speed_max: 1.5 };
                cmd.done(&caps).expect("reply");
            } else {
                cmd.done(&CommandOk {}).expect("reply");
            }
        });
        Ok(())
    });
}

struct Pair {
    conn: Arc<Conn>,
    controller_ctx: RunContext,
    operator_ctx: RunContext,
}

/// Boots both loops; `setup_controller` customizes the controller side.
fn boot(setup_controller: impl FnOnce(&mut Loop)) -> Pair {
    let ((op_reader, op_writer), (ctl_reader, ctl_writer)) = packet_pair();

    let mut controller_loop = Loop::new();
    let mut registrar =
        Registrar::new(Box::new(ctl_reader), Box::new(ctl_writer), registry());
    controller_loop.add(&mut registrar);
    setup_controller(&mut controller_loop);
    let controller_ctx = RunContext::new();
    tokio::spawn(controller_loop.run(controller_ctx.clone()));

    let mut operator_loop = Loop::new();
    let mut conn = Conn::new(Box::new(op_reader), Box::new(op_writer), registry());
    operator_loop.add(&mut conn);
    let operator_ctx = RunContext::new();
    tokio::spawn(operator_loop.run(operator_ctx.clone()));

    Pair { conn: Arc::new(conn), controller_ctx, operator_ctx }
}

impl Pair {
    fn shutdown(&self) {
        self.controller_ctx.cancel();
        self.operator_ctx.cancel();
    }
}

async fn resolve(future: CommandFuture) -> Result<Box<dyn std::any::Any + Send>, ConnError> {
    tokio::time::timeout(Duration::from_secs(30), future.result())
        .await
        .expect("future must resolve within the scenario window")
}

#[tokio::test(start_paused = true)]
async fn command_round_trip() {
    let pair = boot(nav_responder);

    let future = pair.conn.do_command(&Nav2dCapsQuery {}).await;
    let reply = resolve(future).await.expect("caps reply");
    let caps = reply.downcast::<Nav2dCaps>().expect("caps type");
    assert_eq!(caps.drive_speed_max, 350.0);
    assert_eq!(caps.turn_speed_max, 1.5);

    let future = pair.conn.do_command(&Nav2dDrive { speed: 120.0, accel: 0.0 }).await;
    let reply = resolve(future).await.expect("ok reply");
    assert!(reply.downcast::<CommandOk>().is_ok());

    pair.shutdown();
}

#[tokio::test(start_paused = true)]
async fn unclaimed_commands_get_unsupported_replies() {
    let pair = boot(|lp| {
        nav_responder(lp);
        lp.add(&mut UnsupportedCommands);
    });

    // The responder ignores turns; the idle sweep answers instead.
    let turn = Nav2dTurn::at_rate(Angle::from_degrees(30.0));
    let future = pair.conn.do_command(&turn).await;
    let err = resolve(future).await.expect_err("must fail");
    match err {
        ConnError::Remote(remote) => assert_eq!(remote.message, "unsupported command"),
        other => panic!("expected remote error, got {other:?}"),
    }

    pair.shutdown();
}

#[tokio::test(start_paused = true)]
async fn unanswered_commands_expire() {
    // No controller and no sweep: the command is posted into the
    // controller loop and sits there.
    let pair = boot(|_| {});

    let future = pair.conn.do_command(&Nav2dCapsQuery {}).await;
    let err = resolve(future).await.expect_err("must expire");
    assert!(matches!(err, ConnError::Expired), "got {err:?}");

    pair.shutdown();
}

#[tokio::test(start_paused = true)]
async fn teardown_resolves_every_future() {
    let pair = boot(|_| {});

    let future = pair.conn.do_command(&Nav2dCapsQuery {}).await;
    pair.shutdown();
    // Dropping the conn tears down the pending map.
    let conn = Arc::try_unwrap(pair.conn).unwrap_or_else(|_| panic!("sole owner"));
    drop(conn);
    let err = future.result().await.expect_err("must resolve");
    assert!(matches!(err, ConnError::Closed | ConnError::Expired), "got {err:?}");
}

#[tokio::test(start_paused = true)]
async fn controller_events_reach_the_operator_loop() {
    let seen = Arc::new(Mutex::new(Vec::new()));

    let ((op_reader, op_writer), (ctl_reader, ctl_writer)) = packet_pair();

    let mut controller_loop = Loop::new();
    let mut registrar =
        Registrar::new(Box::new(ctl_reader), Box::new(ctl_writer), registry());
    controller_loop.add(&mut registrar);
    let registrar = Arc::new(registrar);
    let controller_ctx = RunContext::new();
    tokio::spawn(controller_loop.run(controller_ctx.clone()));

    let mut operator_loop = Loop::new();
    let mut conn = Conn::new(Box::new(op_reader), Box::new(op_writer), registry());
    operator_loop.add(&mut conn);
    let log = seen.clone();
    operator_loop.add_controller(scheduler::CONTROL, move |cc: &mut ControlContext<'_>| {
        cc.messages().process(|mctx| {
            if let Some(event) = mctx.take_as::<Telemetry>() {
                log.lock().expect("lock").push(event.reading);
            }
        });
        Ok(())
    });
    let operator_ctx = RunContext::new();
    tokio::spawn(operator_loop.run(operator_ctx.clone()));

    registrar.send_event(&Telemetry { reading: 7 }).expect("send event");
    registrar.send_event(&Telemetry { reading: 8 }).expect("send event");

    // Give both loops a few virtual ticks to move the events across.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(*seen.lock().expect("lock"), vec![7, 8]);

    controller_ctx.cancel();
    operator_ctx.cancel();
}
