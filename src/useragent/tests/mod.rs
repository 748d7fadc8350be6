mod test_registration;

use crate::call::{CallController, PhoneState};
use crate::config::Config;
use crate::useragent::{UserAgent, UserAgentBuilder};
use std::sync::Arc;
use std::time::Duration;

pub(crate) fn test_config(username: &str, server: &str) -> Config {
    let mut config = Config::default();
    config.addr = Some("127.0.0.1".to_string());
    config.port = 0;
    config.server = server.to_string();
    config.username = username.to_string();
    config.password = "secret".to_string();
    config.register = false;
    config.sip_t1_ms = Some(50);
    config.sip_t4_ms = Some(200);
    config
}

pub(crate) async fn spawn_ua(config: Config) -> Arc<UserAgent> {
    let ua = Arc::new(
        UserAgentBuilder::new()
            .with_config(Some(config))
            .build()
            .await
            .expect("build user agent"),
    );
    let serving = ua.clone();
    tokio::spawn(async move { serving.serve().await });
    ua
}

pub(crate) async fn wait_for_state(
    controller: &CallController,
    what: &str,
    predicate: impl Fn(&PhoneState) -> bool,
) {
    let mut rx = controller.watch();
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if predicate(&rx.borrow_and_update()) {
                return;
            }
            if rx.changed().await.is_err() {
                panic!("state channel closed waiting for {}", what);
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}
