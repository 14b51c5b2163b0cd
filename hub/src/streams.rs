use tokio::sync::mpsc;
use tonic::Status;

use step::{OutStreams, Status as SubstepStatus, Substep};
use upgrade_proto::idl::{self, chunk, message};
use utils::exec::OutputSink;

pub type MessageSender = mpsc::UnboundedSender<Result<idl::Message, Status>>;

/// Forwards a phase's output and substep statuses to the CLI over the phase's response
/// stream.
pub struct MessageStreams {
    tx: MessageSender,
}

impl MessageStreams {
    pub fn new(tx: MessageSender) -> Self {
        MessageStreams { tx }
    }

    fn send(&self, contents: message::Contents) {
        // The CLI may have gone away. The phase carries on regardless and its outcome is
        // in the step store and the log.
        if self
            .tx
            .send(Ok(idl::Message {
                contents: Some(contents),
            }))
            .is_err()
        {
            tracing::debug!("dropping message, the client has disconnected");
        }
    }

    pub fn respond(&self, response: idl::response::Contents) {
        self.send(message::Contents::Response(idl::Response {
            contents: Some(response),
        }));
    }

    pub fn fail(&self, status: Status) {
        let _ = self.tx.send(Err(status));
    }

    fn chunk(&self, buf: &[u8], ty: chunk::Type) {
        self.send(message::Contents::Chunk(idl::Chunk {
            buffer: buf.to_vec().into(),
            r#type: ty.into(),
        }));
    }
}

impl OutputSink for MessageStreams {
    fn stdout(&self, buf: &[u8]) {
        tracing::debug!("{}", String::from_utf8_lossy(buf).trim_end());
        self.chunk(buf, chunk::Type::Stdout);
    }

    fn stderr(&self, buf: &[u8]) {
        tracing::debug!("{}", String::from_utf8_lossy(buf).trim_end());
        self.chunk(buf, chunk::Type::Stderr);
    }
}

impl OutStreams for MessageStreams {
    fn substep_status(&self, substep: Substep, status: SubstepStatus) {
        self.send(message::Contents::Status(idl::SubstepStatus {
            substep: substep.to_string(),
            status: status.to_string(),
        }));
    }

    fn sink(&self) -> &dyn OutputSink {
        self
    }
}
