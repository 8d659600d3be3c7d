use fission::{
    ConnId, ListenArgs, Protocol, Runtime, RuntimeConfig, StartArgs, Supervisor,
};
use quark::logging;
use std::sync::Arc;

struct EchoProtocol;

impl Protocol for EchoProtocol {
    fn on_data(&self, rt: &Arc<Runtime>, uuid: ConnId) {
        let mut buf = [0u8; 4096];

        loop {
            match rt.read(uuid, &mut buf) {
                Ok(0) => break,
                Ok(count) => {
                    if rt.write(uuid, buf[..count].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    }

    fn ping(&self, rt: &Arc<Runtime>, uuid: ConnId) {
        drop(rt.write(uuid, &b"still there?\n"[..]));
    }
}

fn main() {
    let log = logging::root(Some(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    ));

    let supervisor = Supervisor::new(RuntimeConfig {
        capacity: 0,
        log: Some(log.clone()),
    })
    .expect("runtime construction failed");

    supervisor
        .listen(ListenArgs {
            address: String::new(),
            port: "28008".into(),
            on_open: Arc::new(|rt, uuid| {
                logging::info!(rt.log(), "client connected";
                               "uuid" => %uuid,
                               "peer" => ?rt.peer_addr(uuid));

                rt.attach(uuid, Arc::new(EchoProtocol)).expect("attach failed");
                rt.timeout_set(uuid, 30);
                drop(rt.write(uuid, &b"echo service ready\n"[..]));
            }),
            on_start: None,
            on_finish: None,
        })
        .expect("bind failed");

    logging::info!(log, "echo server on port 28008");

    supervisor.start(StartArgs {
        threads: 2,
        workers: 1,
    });
}
