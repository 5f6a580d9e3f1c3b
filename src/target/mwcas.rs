use crate::descriptor::Descriptor;
use crate::err::Error;
use crate::operation::Operation;
use crate::session::Session;
use tracing::trace;

pub(super) fn execute(session: &Session, operation: &Operation) -> Result<usize, Error> {
    if operation.is_empty() {
        return Err(Error::NoTargets);
    }
    let mut retries: usize = 0;
    loop {
        let mut descriptor: Descriptor = session.descriptor()?;
        for &position in operation.positions() {
            let current: u64 = session.read(position)?;
            descriptor.stage(position, current, current + 1)?;
        }
        if descriptor.commit()? {
            return Ok(1);
        }
        retries += 1;
        trace!("lost a race, retry {retries}");
    }
}
