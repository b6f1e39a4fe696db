use crate::{
    Result,
    address::Address,
    chain::{
        UNKNOWN_CHAIN_CODE,
        WalletProvider,
    },
    error::Error,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::sync::atomic::{
    AtomicBool,
    Ordering,
};
use tokio::sync::watch;
use tracing::{
    info,
    warn,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletSession {
    pub address: Address,
    pub chain_id: u64,
}

/// Owns the account/chain negotiation with a wallet provider and publishes
/// the current session to subscribers.
pub struct WalletConnection<W> {
    provider: W,
    target_chain_id: u64,
    connecting: AtomicBool,
    session: watch::Sender<Option<WalletSession>>,
}

struct ConnectingGuard<'a>(&'a AtomicBool);

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<W: WalletProvider> WalletConnection<W> {
    pub fn new(provider: W, target_chain_id: u64) -> Self {
        let (session, _) = watch::channel(None);
        Self {
            provider,
            target_chain_id,
            connecting: AtomicBool::new(false),
            session,
        }
    }

    pub fn provider(&self) -> &W {
        &self.provider
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<WalletSession>> {
        self.session.subscribe()
    }

    pub fn current(&self) -> Option<WalletSession> {
        *self.session.borrow()
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::Acquire)
    }

    pub async fn connect(&self) -> Result<WalletSession> {
        if self.connecting.swap(true, Ordering::AcqRel) {
            return Err(Error::ConnectionInProgress);
        }
        let _guard = ConnectingGuard(&self.connecting);

        let session = self.negotiate().await?;
        info!(address = %session.address, chain_id = session.chain_id, "wallet connected");
        self.session.send_replace(Some(session));
        Ok(session)
    }

    pub fn disconnect(&self) {
        if self.session.send_replace(None).is_some() {
            info!("wallet disconnected");
        }
    }

    async fn negotiate(&self) -> Result<WalletSession> {
        let session = self.provider.connect().await?;
        if session.chain_id == self.target_chain_id {
            return Ok(session);
        }

        info!(
            from = session.chain_id,
            to = self.target_chain_id,
            "requesting network switch"
        );
        let mismatch = Error::NetworkMismatch {
            expected: self.target_chain_id,
            actual: session.chain_id,
        };
        match self.provider.switch_network(self.target_chain_id).await {
            Ok(true) => {}
            Ok(false) => return Err(mismatch),
            Err(err) if err.is_user_rejection() => return Err(mismatch),
            Err(err) if err.code == Some(UNKNOWN_CHAIN_CODE) => {
                warn!(chain_id = self.target_chain_id, "wallet does not know the target chain");
                return Err(mismatch);
            }
            Err(err) => return Err(err.into()),
        }

        let chain_id = self.provider.chain_id().await?;
        if chain_id != self.target_chain_id {
            return Err(Error::NetworkMismatch {
                expected: self.target_chain_id,
                actual: chain_id,
            });
        }
        Ok(WalletSession { chain_id, ..session })
    }
}
