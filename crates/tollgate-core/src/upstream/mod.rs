mod retry;
mod transport;

pub use transport::{
    ReqwestTransport, Transport, TransportError, TransportErrorKind, UpstreamRequest,
    UpstreamResponse,
};
