use crate::err::Error;
use crate::operation::Operation;
use crate::session::Session;
use crate::sync::spin_wait;
use crate::types::Position;

pub(super) fn execute(session: &Session, operation: &Operation) -> Result<usize, Error> {
    if operation.len() > 1 {
        return Err(Error::UnsupportedArity(operation.len()));
    }
    let position: Position = operation.position(0).ok_or(Error::NoTargets)?;

    let config = session.pool().config();
    let mut attempt: usize = 0;
    loop {
        let current: u64 = session.read(position)?;
        if session.pcas(position, current, current + 1)? {
            return Ok(1);
        }
        spin_wait(attempt, config.spin_retries, config.backoff);
        attempt += 1;
    }
}
