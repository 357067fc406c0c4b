//! Ownership of the opened endpoint handles of one board
use crate::{
    core::{
        ConnectionResult,
        EndpointId,
        Error,
        MAX_EP_CNT,
    },
    endpoints::EndpointConfig,
};
use std::sync::{
    Mutex,
    MutexGuard,
    PoisonError,
    RwLock,
    RwLockReadGuard,
    RwLockWriteGuard,
};
use tracing::{
    debug,
    warn,
};
use xillybus::{
    AbortToken,
    Backend,
    EndpointIo,
};

/// A panicking transfer can't leave a handle in a state the next transfer can't use, so poisoned
/// locks are just taken over
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// One opened handle. The lock keeps transfers on the same endpoint strictly one after another.
pub(crate) type Slot = Mutex<Box<dyn EndpointIo>>;

/// The full set of handles for one board, either all open or not existing at all
#[derive(Debug)]
pub(crate) struct EndpointSet {
    ctrl_read: Slot,
    ctrl_write: Slot,
    stream_read: Vec<Slot>,
    stream_write: Vec<Slot>,
}

impl EndpointSet {
    /// Open every endpoint `config` requires, control endpoints first and then the stream pairs in
    /// ascending order. If any open fails the handles opened so far are closed again before the
    /// error is returned.
    pub(crate) fn open_all(
        backend: &dyn Backend,
        config: &EndpointConfig,
    ) -> ConnectionResult<Self> {
        let open = |endpoint: EndpointId, path: &str| -> ConnectionResult<Slot> {
            match backend.open(path, endpoint.direction()) {
                Ok(handle) => {
                    debug!(%endpoint, path, "endpoint open");
                    Ok(Mutex::new(handle))
                }
                Err(source) => {
                    warn!(
                        %endpoint,
                        path,
                        os_error = ?source.os_error(),
                        "endpoint failed to open"
                    );
                    Err(Error::Open { endpoint, source })
                }
            }
        };
        // Every early return below drops (and so closes) whatever was already opened
        let ctrl_read = open(EndpointId::ControlRead, config.ctrl_read)?;
        let ctrl_write = open(EndpointId::ControlWrite, config.ctrl_write)?;
        let streams = config.stream_count();
        let mut stream_read = Vec::with_capacity(streams);
        let mut stream_write = Vec::with_capacity(streams);
        for i in 0..streams {
            stream_read.push(open(EndpointId::StreamRead(i), config.stream_read[i])?);
            stream_write.push(open(EndpointId::StreamWrite(i), config.stream_write[i])?);
        }
        Ok(Self {
            ctrl_read,
            ctrl_write,
            stream_read,
            stream_write,
        })
    }

    /// Close every handle in the set
    pub(crate) fn close_all(self) {
        debug!(streams = self.stream_read.len(), "closing all endpoints");
        drop(self);
    }

    /// The number of stream endpoint pairs that are open
    pub(crate) fn stream_count(&self) -> usize {
        self.stream_read.len()
    }

    /// The handle behind `endpoint`
    pub(crate) fn slot(&self, endpoint: EndpointId) -> ConnectionResult<&Slot> {
        match endpoint {
            EndpointId::ControlRead => Some(&self.ctrl_read),
            EndpointId::ControlWrite => Some(&self.ctrl_write),
            EndpointId::StreamRead(i) => self.stream_read.get(i),
            EndpointId::StreamWrite(i) => self.stream_write.get(i),
        }
        .ok_or(Error::InvalidEndpoint(endpoint))
    }
}

/// The abort flags of every possible endpoint. These outlive any particular [`EndpointSet`] so an
/// abort never has to wait on a handle lock.
#[derive(Debug, Default)]
pub(crate) struct AbortTokens {
    ctrl_read: AbortToken,
    ctrl_write: AbortToken,
    stream_read: [AbortToken; MAX_EP_CNT],
    stream_write: [AbortToken; MAX_EP_CNT],
}

impl AbortTokens {
    pub(crate) fn token(&self, endpoint: EndpointId) -> ConnectionResult<&AbortToken> {
        match endpoint {
            EndpointId::ControlRead => Some(&self.ctrl_read),
            EndpointId::ControlWrite => Some(&self.ctrl_write),
            EndpointId::StreamRead(i) => self.stream_read.get(i),
            EndpointId::StreamWrite(i) => self.stream_write.get(i),
        }
        .ok_or(Error::InvalidEndpoint(endpoint))
    }

    fn all(&self) -> impl Iterator<Item = &AbortToken> {
        [&self.ctrl_read, &self.ctrl_write]
            .into_iter()
            .chain(self.stream_read.iter())
            .chain(self.stream_write.iter())
    }

    pub(crate) fn abort_all(&self) {
        self.all().for_each(AbortToken::abort);
    }

    pub(crate) fn rearm_all(&self) {
        self.all().for_each(AbortToken::rearm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        endpoints::DEVICE_CONFIGS,
        transport::mock::Mock,
    };

    #[test]
    fn test_open_all() {
        let mock = Mock::with_boards(&[1]);
        let set = EndpointSet::open_all(&mock, &DEVICE_CONFIGS[1]).unwrap();
        assert_eq!(set.stream_count(), 2);
        assert_eq!(mock.open_handles(), 6);
        assert!(set.slot(EndpointId::StreamWrite(1)).is_ok());
        assert!(matches!(
            set.slot(EndpointId::StreamRead(2)),
            Err(Error::InvalidEndpoint(EndpointId::StreamRead(2)))
        ));
        set.close_all();
        assert_eq!(mock.open_handles(), 0);
        assert_eq!(mock.closes(), 6);
    }

    #[test]
    fn test_rollback_on_failure() {
        let mock = Mock::with_boards(&[1]);
        // EACCES
        mock.refuse("/dev/xillybus_stream1_read_32", 13);
        let err = EndpointSet::open_all(&mock, &DEVICE_CONFIGS[1]).unwrap_err();
        assert_eq!(err.os_error(), Some(13));
        assert!(matches!(
            err,
            Error::Open {
                endpoint: EndpointId::StreamRead(1),
                ..
            }
        ));
        // Control and stream 0 were opened, then all closed again
        assert_eq!(mock.opens(), 4);
        assert_eq!(mock.closes(), 4);
        assert_eq!(mock.open_handles(), 0);
    }

    #[test]
    fn test_missing_board() {
        let mock = Mock::default();
        let err = EndpointSet::open_all(&mock, &DEVICE_CONFIGS[0]).unwrap_err();
        assert!(matches!(
            err,
            Error::Open {
                endpoint: EndpointId::ControlRead,
                ..
            }
        ));
        assert_eq!(mock.opens(), 0);
    }

    #[test]
    fn test_abort_tokens() {
        let tokens = AbortTokens::default();
        tokens.token(EndpointId::StreamRead(1)).unwrap().abort();
        tokens.token(EndpointId::ControlWrite).unwrap().abort();
        assert!(tokens.token(EndpointId::StreamRead(1)).unwrap().is_aborted());
        assert!(!tokens.token(EndpointId::StreamRead(0)).unwrap().is_aborted());
        assert!(tokens.token(EndpointId::StreamWrite(2)).is_err());
        tokens.rearm_all();
        assert!(tokens.all().all(|t| !t.is_aborted()));
        tokens.abort_all();
        assert!(tokens.all().all(AbortToken::is_aborted));
        tokens.rearm_all();
        assert!(!tokens.token(EndpointId::StreamRead(1)).unwrap().is_aborted());
        assert!(!tokens.token(EndpointId::ControlWrite).unwrap().is_aborted());
    }
}
