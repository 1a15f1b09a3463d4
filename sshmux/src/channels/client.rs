use std::ops::Deref;
use std::sync::Arc;

use log::{debug, warn};

use super::{ChannelCore, ChannelHandler, Reply};
use crate::helpers::lock;
use crate::parsing::{ChannelMessage, ChannelType};
use crate::session::Session;
use crate::Error;

/// A channel opened by us.
///
/// Dropping it closes the channel without waiting for the server; use
/// [ChannelCore::close] to wait for the server's CLOSE.
#[derive(Debug)]
pub struct ClientChannel {
    core: Arc<ChannelCore>,
}

impl Deref for ClientChannel {
    type Target = ChannelCore;
    fn deref(&self) -> &ChannelCore {
        &self.core
    }
}

impl ClientChannel {
    /// Allocate a channel number. Nothing is sent before
    /// [ClientChannel::open].
    pub fn new<H: ChannelHandler + 'static>(session: &Session, handler: H) -> ClientChannel {
        let core = session.register_channel(|id| ChannelCore::new(session, id, None, Box::new(handler)));
        ClientChannel { core }
    }

    pub fn core(&self) -> &Arc<ChannelCore> {
        &self.core
    }

    /// Ask the server to open the channel, retrying up to
    /// [Config::retry_attempts](crate::Config::retry_attempts) times if
    /// it refuses. Each attempt holds one permit of the session's open
    /// semaphore; the permit of the successful attempt is kept until
    /// the channel closes.
    pub async fn open(&self, typ: ChannelType) -> Result<(), Error> {
        if self.core.remote_id().is_some() || self.core.closed.is_set() {
            return Err(Error::Inconsistent);
        }
        let session = self.core.session();
        let attempts = session.config().retry_attempts.max(1);
        let mut remaining = attempts;
        loop {
            let permit = tokio::select! {
                permit = session.open_semaphore().clone().acquire_owned() => {
                    permit.map_err(|_| Error::Inconsistent)?
                }
                e = session.failed() => {
                    self.core.abandon();
                    return Err(e);
                }
            };
            *lock(&self.core.permit) = Some(permit);

            debug!("opening channel {} as {:?}", self.core.id(), typ.name());
            let outcome = match self.core.send_expecting_reply(ChannelMessage::Open {
                typ: typ.clone(),
                sender_channel: self.core.id().into(),
                initial_window_size: self.core.local_window_size(),
                maximum_packet_size: self.core.local_packet_size(),
            }) {
                Ok(reply) => session.wait_on_handle(reply).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(Ok(Reply::OpenConfirmed)) => return Ok(()),
                Ok(Ok(Reply::OpenFailed {
                    reason,
                    description,
                })) => {
                    self.release_permit();
                    remaining -= 1;
                    warn!(
                        "channel {} open refused ({:?}: {:?}), {} attempts left",
                        self.core.id(),
                        reason,
                        description,
                        remaining
                    );
                    if remaining == 0 {
                        self.core.abandon();
                        return Err(Error::ChannelOpenFailed {
                            attempts,
                            reason,
                            description,
                        });
                    }
                }
                Ok(Ok(_)) => {
                    self.core.abandon();
                    return Err(Error::Inconsistent);
                }
                Ok(Err(_)) => {
                    self.core.abandon();
                    return Err(Error::Disconnect);
                }
                Err(e) => {
                    self.core.abandon();
                    return Err(e);
                }
            }
        }
    }

    fn release_permit(&self) {
        lock(&self.core.permit).take();
    }
}
