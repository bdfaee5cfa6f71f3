use kernel_ipc::testing::ThreadBlocker;
use kernel_ipc::{Blocker, Mailbox, MailboxError, Message, WakeReason};
use kernel_sched::Handle;
use std::thread;

#[test]
fn call_returns_the_receivers_answer() {
    let mb = Mailbox::new();
    let b = ThreadBlocker::new();

    thread::scope(|scope| {
        let caller = scope.spawn(|| {
            let mut msg = Message::with_data(1, b"ping").unwrap();
            let result = mb.call(&b, &mut msg);
            (result, msg)
        });

        let received = mb.receive(&b, true).unwrap();
        assert_eq!(received.data(), b"ping");
        assert_ne!(received.reply_tag, 0);

        let mut answer = received;
        answer.set_data(b"pong");
        answer.tag = 2;
        assert!(answer.push_handle(Handle(0x44)));
        {
            let mut replyer = mb.reply(&b, received.reply_tag).unwrap();
            assert!(replyer.valid());
            assert_eq!(replyer.message().data(), b"ping");
            *replyer.message_mut() = answer;
        }

        let (result, msg) = caller.join().unwrap();
        assert_eq!(result, Ok(()));
        assert_eq!(msg.tag, 2);
        assert_eq!(msg.data(), b"pong");
        assert_eq!(msg.handles(), &[Handle(0x44)]);

        assert!(matches!(
            mb.reply(&b, received.reply_tag),
            Err(MailboxError::UnknownTag(_))
        ));
    });
    assert_eq!(mb.outstanding_calls(), 0);
}

#[test]
fn dropped_or_refused_replies_fail_the_call() {
    let mb = Mailbox::new();
    let b = ThreadBlocker::new();

    thread::scope(|scope| {
        let dropped = scope.spawn(|| mb.call(&b, &mut Message::new(1)));
        let tag = mb.receive(&b, true).unwrap().reply_tag;
        drop(mb.reply(&b, tag).unwrap());
        assert_eq!(dropped.join().unwrap(), Err(MailboxError::NoReply));

        let refused = scope.spawn(|| mb.call(&b, &mut Message::new(2)));
        let tag = mb.receive(&b, true).unwrap().reply_tag;
        let mut replyer = mb.reply(&b, tag).unwrap();
        replyer.message_mut().tag = 99;
        replyer.set_error(13);
        drop(replyer);
        assert_eq!(refused.join().unwrap(), Err(MailboxError::Refused(13)));
    });
}

#[test]
fn send_does_not_wait() {
    let mb = Mailbox::new();
    let b = ThreadBlocker::new();
    assert_eq!(mb.receive(&b, false), Err(MailboxError::WouldBlock));

    let mut msg = Message::new(5);
    msg.reply_tag = 77;
    mb.send(&b, msg).unwrap();
    mb.send(&b, Message::new(6)).unwrap();
    assert_eq!(mb.queued(), 2);

    let first = mb.receive(&b, false).unwrap();
    assert_eq!((first.tag, first.reply_tag), (5, 0));
    assert_eq!(mb.receive(&b, true).unwrap().tag, 6);
    assert_eq!(b.blocked(), 0);
}

#[test]
fn send_hands_off_to_a_parked_receiver() {
    let mb = Mailbox::new();
    let b = ThreadBlocker::new();
    thread::scope(|scope| {
        let receiver = scope.spawn(|| mb.receive(&b, true));
        b.wait_for_blocked(1);
        assert_eq!(mb.waiting_receivers(), 1);
        mb.send(&b, Message::new(8)).unwrap();
        assert_eq!(receiver.join().unwrap().map(|m| m.tag), Ok(8));
    });
    assert_eq!(mb.queued(), 0);
}

#[test]
fn close_wakes_blocked_receivers() {
    let mb = Mailbox::new();
    let b = ThreadBlocker::new();

    thread::scope(|scope| {
        let receivers: Vec<_> = (0..2).map(|_| scope.spawn(|| mb.receive(&b, true))).collect();
        b.wait_for_blocked(2);

        assert_eq!(mb.close(&b), 2);
        for r in receivers {
            assert_eq!(r.join().unwrap(), Err(MailboxError::Closed));
        }
    });
    assert!(mb.is_closed());
    assert_eq!(mb.close(&b), 0);
    assert_eq!(mb.send(&b, Message::new(1)), Err(MailboxError::Closed));
    assert_eq!(mb.receive(&b, false), Err(MailboxError::Closed));
}

#[test]
fn close_fails_waiting_calls() {
    let mb = Mailbox::new();
    let b = ThreadBlocker::new();

    thread::scope(|scope| {
        let caller = scope.spawn(|| mb.call(&b, &mut Message::new(3)));
        b.wait_for_blocked(1);
        let tag = mb.receive(&b, false).unwrap().reply_tag;

        assert_eq!(mb.close(&b), 1);
        assert_eq!(caller.join().unwrap(), Err(MailboxError::Closed));
        assert!(matches!(mb.reply(&b, tag), Err(MailboxError::UnknownTag(_))));
    });
}

#[test]
fn replying_after_close_reports_closed() {
    let mb = Mailbox::new();
    let b = ThreadBlocker::new();

    thread::scope(|scope| {
        let caller = scope.spawn(|| mb.call(&b, &mut Message::new(4)));
        let tag = mb.receive(&b, true).unwrap().reply_tag;
        let mut replyer = mb.reply(&b, tag).unwrap();
        assert_eq!(mb.close(&b), 0);
        assert!(!replyer.valid());
        replyer.message_mut().tag = 40;
        drop(replyer);
        assert_eq!(caller.join().unwrap(), Err(MailboxError::Closed));
    });
}

#[test]
fn callers_get_distinct_tags() {
    let mb = Mailbox::new();
    let b = ThreadBlocker::new();

    thread::scope(|scope| {
        let callers: Vec<_> = (0..3)
            .map(|i| {
                let (mb, b) = (&mb, &b);
                scope.spawn(move || {
                    let mut msg = Message::new(i);
                    mb.call(b, &mut msg).map(|()| msg.tag)
                })
            })
            .collect();
        b.wait_for_blocked(3);
        assert_eq!(mb.outstanding_calls(), 3);

        let mut tags: Vec<u16> = (0..3).map(|_| mb.receive(&b, false).unwrap().reply_tag).collect();
        tags.sort_unstable();
        tags.dedup();
        assert_eq!(tags.len(), 3);

        for tag in tags {
            let mut replyer = mb.reply(&b, tag).unwrap();
            replyer.message_mut().tag += 100;
        }
        let mut answers: Vec<u64> = callers.into_iter().map(|c| c.join().unwrap().unwrap()).collect();
        answers.sort_unstable();
        assert_eq!(answers, [100, 101, 102]);
    });
}

#[test]
fn stray_wake_keeps_the_receiver_parked() {
    let mb = Mailbox::new();
    let b = ThreadBlocker::new();
    let (tx, rx) = std::sync::mpsc::channel();

    thread::scope(|scope| {
        let receiver = scope.spawn(|| {
            tx.send(b.current()).unwrap();
            mb.receive(&b, true)
        });
        let tid = rx.recv().unwrap();
        b.wait_for_blocked(1);

        b.wake(tid, WakeReason::Message);
        assert!(!mb.is_closed());
        mb.send(&b, Message::with_data(5, b"late").unwrap()).unwrap();

        let got = receiver.join().unwrap().unwrap();
        assert_eq!((got.tag, got.data()), (5, &b"late"[..]));
    });
    assert_eq!(mb.waiting_receivers(), 0);
}
