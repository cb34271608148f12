use tokio::sync::oneshot;

use crate::{
    Payload, WaiterCleaner,
    error::{Error, ErrorKind, Result},
};

/// The waiting half of a pending call.
///
/// Dropping it before the response arrives forgets the call.
pub struct Receiver<'a> {
    rx: oneshot::Receiver<Result<Payload>>,
    cleaner: WaiterCleaner<'a>,
}

impl<'a> Receiver<'a> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<Payload>>, cleaner: WaiterCleaner<'a>) -> Self {
        Self { rx, cleaner }
    }

    /// # Errors
    pub async fn recv(self) -> Result<Payload> {
        let Self { rx, cleaner } = self;
        let result = rx
            .await
            .map_err(|e| Error::new(ErrorKind::ConnectionClosed, e.to_string()));
        std::mem::forget(cleaner); // the entry is already gone once the sender fired.
        result?
    }
}
