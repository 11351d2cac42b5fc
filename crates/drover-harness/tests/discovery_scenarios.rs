//! Discovery and bus-bound controller scenarios over the memory broker.

use std::{sync::Arc, time::Duration};

use drover_core::{
    Loop, RunContext,
    meta::{ControllerInfo, ControllerMeta, ControllerRef},
    pubsub::{BusConnector, BusRegistrar, PubSub},
    registrar::{CommandMsg, UnsupportedCommands},
    scheduler::{self, ControlContext},
};
use drover_harness::MemBus;
use drover_proto::{
    Registry,
    messages::{Nav2dCaps, Nav2dCapsQuery},
};

fn bus() -> Arc<dyn PubSub> {
    Arc::new(MemBus::new())
}

fn nav_info() -> ControllerInfo {
    ControllerInfo {
        reference: ControllerRef::new("nav", "bot-1"),
        meta: ControllerMeta { description: "test bot".into(), ..Default::default() },
    }
}

async fn start_controller(bus: Arc<dyn PubSub>) -> RunContext {
    let mut registrar = BusRegistrar::new(bus, nav_info(), Arc::new(Registry::builtin()))
        .await
        .expect("bind registrar");

    let mut lp = Loop::new();
    lp.add(&mut registrar);
    lp.add_controller(scheduler::CONTROL, |cc: &mut ControlContext<'_>| {
        cc.messages().process(|mctx| {
            let is_caps = mctx
                .current()
                .and_then(|m| m.downcast_ref::<CommandMsg>())
                .is_some_and(|cm| cm.command.msg_as::<Nav2dCapsQuery>().is_some());
            if is_caps {
                let cmd = mctx.take_as::<CommandMsg>().expect("checked above").command;
                cmd.done(&Nav2dCaps { drive_speed_max: 200.0, turn_speed_max: 1.0 })
                    .expect("reply");
            }
        });
        Ok(())
    });
    lp.add(&mut UnsupportedCommands);

    let ctx = RunContext::new();
    tokio::spawn(lp.run(ctx.clone()));
    // Let the meta lifecycle publish before anyone discovers.
    tokio::task::yield_now().await;
    ctx
}

#[tokio::test(start_paused = true)]
async fn retained_meta_drives_discovery() {
    let bus = bus();
    let controller_ctx = start_controller(bus.clone()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let connector = BusConnector::new(bus.clone(), Arc::new(Registry::builtin()));
    let found = connector.discover().await.expect("discover");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].reference, ControllerRef::new("nav", "bot-1"));
    assert_eq!(found[0].meta.description, "test bot");

    // Shutdown publishes the tombstone; a later discovery sees nothing.
    controller_ctx.cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let found = connector.discover().await.expect("discover");
    assert!(found.is_empty(), "tombstone must clear the retained meta");
}

#[tokio::test(start_paused = true)]
async fn connect_and_command_over_the_bus() {
    let bus = bus();
    let controller_ctx = start_controller(bus.clone()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let connector = BusConnector::new(bus.clone(), Arc::new(Registry::builtin()));
    let mut conn = connector
        .connect(&ControllerRef::new("nav", "bot-1"))
        .await
        .expect("connect");

    let mut operator_loop = Loop::new();
    operator_loop.add(&mut conn);
    let operator_ctx = RunContext::new();
    tokio::spawn(operator_loop.run(operator_ctx.clone()));

    let future = conn.do_command(&Nav2dCapsQuery {}).await;
    let reply = tokio::time::timeout(Duration::from_secs(30), future.result())
        .await
        .expect("within window")
        .expect("caps reply");
    let caps = reply.downcast::<Nav2dCaps>().expect("caps type");
    assert_eq!(caps.drive_speed_max, 200.0);

    operator_ctx.cancel();
    controller_ctx.cancel();
}
