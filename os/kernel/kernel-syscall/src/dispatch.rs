use crate::{Status, SyscallNumber, TrapFrame};
use kernel_ipc::{Blocker, Channel, MESSAGE_SIZE, Mailbox, MailboxError, Message};
use kernel_sched::Handle;
use log::{trace, warn};

/// Bytes one channel call moves at most. Longer requests are partial
/// transfers, which callers already have to handle.
pub const MAX_TRANSFER: usize = 256;

/// What a system call needs from the calling thread's context.
pub trait SyscallContext {
    type Blocker: Blocker + ?Sized;

    fn blocker(&self) -> &Self::Blocker;

    /// Stamped into every message the caller sends.
    fn badge(&self) -> u64;

    fn channel(&self, handle: Handle) -> Option<&Channel>;

    fn mailbox(&self, handle: Handle) -> Option<&Mailbox>;

    /// The calling process' own mailbox.
    fn endpoint(&self) -> Option<&Mailbox>;

    /// # Errors
    /// [`Status::ERR_INVALID_ARG`] when the range is not readable user
    /// memory.
    fn copy_from_user(&self, addr: u64, buf: &mut [u8]) -> Result<(), Status>;

    /// # Errors
    /// [`Status::ERR_INVALID_ARG`] when the range is not writable user
    /// memory.
    fn copy_to_user(&self, addr: u64, data: &[u8]) -> Result<(), Status>;

    /// Make sure `len` bytes at `addr` can be written, backing demand pages
    /// on the way. Runs before anything is taken out of an object, so a bad
    /// buffer never swallows data.
    ///
    /// The default zero-fills the range.
    ///
    /// # Errors
    /// [`Status::ERR_INVALID_ARG`] when the range is not writable user
    /// memory.
    fn check_user_writable(&self, addr: u64, len: usize) -> Result<(), Status> {
        const ZEROS: [u8; MAX_TRANSFER] = [0; MAX_TRANSFER];
        let mut done = 0;
        while done < len {
            let n = (len - done).min(MAX_TRANSFER);
            self.copy_to_user(addr.checked_add(done as u64).ok_or(Status::ERR_INVALID_ARG)?, &ZEROS[..n])?;
            done += n;
        }
        Ok(())
    }
}

/// A failed call: status plus the value returned next to it.
struct Failure(Status, u64);

impl From<Status> for Failure {
    fn from(value: Status) -> Self {
        Self(value, 0)
    }
}

impl From<MailboxError> for Failure {
    fn from(value: MailboxError) -> Self {
        match value {
            MailboxError::Refused(code) => Self(Status::ERR_REFUSED, code),
            e => Self(e.into(), 0),
        }
    }
}

/// Run the call described by `frame` and store its result back into it.
pub fn dispatch<C: SyscallContext + ?Sized>(ctx: &C, frame: &mut TrapFrame) {
    let Some(number) = SyscallNumber::from_raw(frame.number()) else {
        warn!("unknown syscall {:#x}", frame.number());
        frame.set_result(Status::ERR_UNKNOWN_SYSCALL, 0);
        return;
    };
    trace!("syscall {number:?}");
    let args = [frame.arg(0), frame.arg(1), frame.arg(2), frame.arg(3)];
    match run(ctx, number, args) {
        Ok(value) => frame.set_result(Status::OK, value),
        Err(Failure(status, value)) => frame.set_result(status, value),
    }
}

fn run<C: SyscallContext + ?Sized>(ctx: &C, number: SyscallNumber, args: [u64; 4]) -> Result<u64, Failure> {
    let b = ctx.blocker();
    match number {
        SyscallNumber::EndpointReceive => {
            let mailbox = ctx.endpoint().ok_or(Status::ERR_NOT_FOUND)?;
            ctx.check_user_writable(args[0], MESSAGE_SIZE)?;
            let msg = mailbox.receive(b, args[1] != 0)?;
            write_message(ctx, args[0], &msg)?;
            Ok(0)
        }
        SyscallNumber::ChannelEnqueue => {
            let channel = channel(ctx, args[0])?;
            let mut buf = [0; MAX_TRANSFER];
            let data = &mut buf[..transfer_len(args[2])];
            ctx.copy_from_user(args[1], data)?;
            let n = if args[3] == 0 {
                channel.enqueue(b, data)
            } else {
                channel.enqueue_blocking(b, data)
            }
            .map_err(Status::from)?;
            Ok(n as u64)
        }
        SyscallNumber::ChannelDequeue => {
            let channel = channel(ctx, args[0])?;
            let mut buf = [0; MAX_TRANSFER];
            let out = &mut buf[..transfer_len(args[2])];
            ctx.check_user_writable(args[1], out.len())?;
            let n = if args[3] == 0 {
                channel.dequeue(b, out)
            } else {
                channel.dequeue_blocking(b, out)
            }
            .map_err(Status::from)?;
            ctx.copy_to_user(args[1], &out[..n])?;
            Ok(n as u64)
        }
        SyscallNumber::ChannelClose => Ok(channel(ctx, args[0])?.close(b) as u64),
        SyscallNumber::MailboxSend => {
            let mailbox = mailbox(ctx, args[0])?;
            let mut msg = read_message(ctx, args[1])?;
            msg.badge = ctx.badge();
            mailbox.send(b, msg)?;
            Ok(0)
        }
        SyscallNumber::MailboxCall => {
            let mailbox = mailbox(ctx, args[0])?;
            let mut msg = read_message(ctx, args[1])?;
            ctx.check_user_writable(args[1], MESSAGE_SIZE)?;
            msg.badge = ctx.badge();
            mailbox.call(b, &mut msg)?;
            write_message(ctx, args[1], &msg)?;
            Ok(0)
        }
        SyscallNumber::MailboxReceive => {
            let mailbox = mailbox(ctx, args[0])?;
            ctx.check_user_writable(args[1], MESSAGE_SIZE)?;
            let msg = mailbox.receive(b, args[2] != 0)?;
            write_message(ctx, args[1], &msg)?;
            Ok(0)
        }
        SyscallNumber::MailboxReply => {
            let mailbox = mailbox(ctx, args[0])?;
            let tag = u16::try_from(args[1]).map_err(|_| Status::ERR_INVALID_ARG)?;
            let mut replyer = mailbox.reply(b, tag)?;
            if args[3] != 0 {
                replyer.set_error(args[3]);
            } else {
                // On a bad buffer the replyer drops unanswered and the
                // caller sees no reply.
                *replyer.message_mut() = read_message(ctx, args[2])?;
            }
            Ok(0)
        }
        SyscallNumber::MailboxClose => Ok(mailbox(ctx, args[0])?.close(b) as u64),
    }
}

fn channel<C: SyscallContext + ?Sized>(ctx: &C, raw: u64) -> Result<&Channel, Status> {
    ctx.channel(Handle(raw)).ok_or(Status::ERR_NOT_FOUND)
}

fn mailbox<C: SyscallContext + ?Sized>(ctx: &C, raw: u64) -> Result<&Mailbox, Status> {
    ctx.mailbox(Handle(raw)).ok_or(Status::ERR_NOT_FOUND)
}

fn transfer_len(requested: u64) -> usize {
    usize::try_from(requested).map_or(MAX_TRANSFER, |n| n.min(MAX_TRANSFER))
}

fn read_message<C: SyscallContext + ?Sized>(ctx: &C, addr: u64) -> Result<Message, Status> {
    let mut bytes = [0; MESSAGE_SIZE];
    ctx.copy_from_user(addr, &mut bytes)?;
    Message::from_bytes(&bytes).ok_or(Status::ERR_INVALID_ARG)
}

fn write_message<C: SyscallContext + ?Sized>(ctx: &C, addr: u64, msg: &Message) -> Result<(), Status> {
    ctx.copy_to_user(addr, &msg.to_bytes())
}
