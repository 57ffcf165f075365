//! Periodically move transactions through the pool's pipeline.
//!
//! Each stage has its own ticker. The loop ends when the shutdown signal arrives.

use std::time::Duration;

use crossbeam_channel::{select, tick, Receiver};
use log::error;
use txpool::{unix_now, TxPoolError};

use super::NodeInner;

impl NodeInner {
    pub fn run_txpool_jobs(&self, shutdown: Receiver<()>) {
        let config = self.txpool.lock().config().clone();
        let validate = tick(Duration::from_secs(config.validate_interval));
        let verify = tick(Duration::from_secs(config.verify_interval));
        let process = tick(Duration::from_secs(config.process_interval));
        let expire = tick(Duration::from_secs(config.expire_interval));

        loop {
            select! {
                recv(validate) -> _ => {
                    log_failure(self.txpool.lock().validate_received_transactions());
                },
                recv(verify) -> _ => {
                    log_failure(self.txpool.lock().verify_validated_transactions());
                },
                recv(process) -> _ => {
                    log_failure(self.txpool.lock().process_verified_transactions());
                },
                recv(expire) -> _ => {
                    self.txpool.lock().expire_transactions(unix_now());
                },
                recv(shutdown) -> _ => break,
            }
        }
    }
}

fn log_failure(result: Result<(), TxPoolError>) {
    if let Err(err) = result {
        error!("❌ {}", err);
    }
}
