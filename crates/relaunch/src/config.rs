use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;

use crate::error::ConfigError;
use crate::fetch::Fetcher;
use crate::state::State;

/// The transport a bind address is served over. TCP is the only transport
/// this crate understands; the enum is open so a host crate can extend
/// `ListenerSet` for e.g. Unix domain sockets without this crate needing
/// to know about it up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
}

/// One entry of `Config::addresses`. Bound in order; the index of an
/// `Address` in the list is the stable slot its listener occupies in a
/// child's inherited FD table.
#[derive(Debug, Clone)]
pub struct Address {
    pub transport: Transport,
    pub addr: SocketAddr,
}

impl Address {
    pub fn tcp(addr: SocketAddr) -> Self {
        Address {
            transport: Transport::Tcp,
            addr,
        }
    }
}

/// The result the user program hands back to the slave runtime when it
/// returns. The slave runtime, not the user program, is responsible for
/// actually calling `std::process::exit`.
pub type ExitCode = i32;

/// The opaque entry point invoked inside each child. Must not block
/// forever once `state.should_terminate()` fires; is expected to drain
/// in-flight work and return.
pub type Program = Arc<dyn Fn(State) -> ExitCode + Send + Sync + 'static>;

/// A hook invoked on a validated-but-not-yet-live candidate binary's path.
/// A `false` return aborts the swap.
pub type PreUpgradeCheck = Arc<dyn Fn(&std::path::Path) -> bool + Send + Sync + 'static>;

/// Immutable configuration supplied once to the master at startup.
pub struct Config {
    pub program: Program,
    pub addresses: Vec<Address>,
    pub restart_signal: Signal,
    pub terminate_timeout: Duration,
    pub fetcher: Option<Box<dyn Fetcher>>,
    pub no_restart_after_fetch: bool,
    pub pre_upgrade_check: Option<PreUpgradeCheck>,
    pub debug: bool,
}

impl Config {
    pub fn builder(program: Program) -> ConfigBuilder {
        ConfigBuilder::new(program)
    }

    /// Fatal, eager validation. Called once, before any socket is bound.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for address in &self.addresses {
            if !seen.insert(address.addr) {
                return Err(ConfigError::DuplicateAddress(address.addr));
            }
        }
        Ok(())
    }
}

/// Builds a `Config`, filling in sensible defaults (SIGUSR2 as the
/// restart signal, no fetcher, no addresses).
pub struct ConfigBuilder {
    program: Program,
    addresses: Vec<Address>,
    restart_signal: Signal,
    terminate_timeout: Duration,
    fetcher: Option<Box<dyn Fetcher>>,
    no_restart_after_fetch: bool,
    pre_upgrade_check: Option<PreUpgradeCheck>,
    debug: bool,
}

impl ConfigBuilder {
    pub fn new(program: Program) -> Self {
        ConfigBuilder {
            program,
            addresses: Vec::new(),
            restart_signal: Signal::SIGUSR2,
            terminate_timeout: Duration::from_secs(30),
            fetcher: None,
            no_restart_after_fetch: false,
            pre_upgrade_check: None,
            debug: false,
        }
    }

    pub fn address(mut self, addr: SocketAddr) -> Self {
        self.addresses.push(Address::tcp(addr));
        self
    }

    pub fn restart_signal(mut self, signal: Signal) -> Self {
        self.restart_signal = signal;
        self
    }

    pub fn terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }

    pub fn fetcher(mut self, fetcher: Box<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn no_restart_after_fetch(mut self, value: bool) -> Self {
        self.no_restart_after_fetch = value;
        self
    }

    pub fn pre_upgrade_check(mut self, check: PreUpgradeCheck) -> Self {
        self.pre_upgrade_check = Some(check);
        self
    }

    pub fn debug(mut self, value: bool) -> Self {
        self.debug = value;
        self
    }

    pub fn build(self) -> Result<Config, ConfigError> {
        let config = Config {
            program: self.program,
            addresses: self.addresses,
            restart_signal: self.restart_signal,
            terminate_timeout: self.terminate_timeout,
            fetcher: self.fetcher,
            no_restart_after_fetch: self.no_restart_after_fetch,
            pre_upgrade_check: self.pre_upgrade_check,
            debug: self.debug,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Where the current binary lives on disk. Resolved once at master
/// startup and reused for every spawn and every fetch-swap.
pub fn current_binary_path() -> std::io::Result<PathBuf> {
    std::env::current_exe()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_program() -> Program {
        Arc::new(|_state| 0)
    }

    #[test]
    fn empty_addresses_and_no_fetcher_is_valid() {
        let config = Config::builder(noop_program()).build();
        assert!(config.is_ok());
    }

    #[test]
    fn duplicate_address_is_rejected() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let result = Config::builder(noop_program())
            .address(addr)
            .address(addr)
            .build();
        assert!(matches!(result, Err(ConfigError::DuplicateAddress(a)) if a == addr));
    }

    #[test]
    fn distinct_addresses_are_accepted() {
        let a: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:9002".parse().unwrap();
        let result = Config::builder(noop_program()).address(a).address(b).build();
        assert!(result.is_ok());
    }
}
