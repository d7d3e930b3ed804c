// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Rendezvous IPC between spawned processes
//! INTENT: Value and page delivery, no-page delivery, single winner among concurrent senders
//! TESTS: page transfer shares the frame; value-only send leaves the destination unmapped;
//!        exactly one of two senders succeeds (sequential and threaded)

use std::sync::{Arc, Barrier};
use std::task::Poll;
use std::thread;

use exo::KernelConfig;
use exo_abi::layout::UTOP;
use exo_abi::{Error, Perm, ProcStatus, Sys};
use exo_e2e::{boot, spawn, standard_image, RW};
use exo_ulib::ipc::{self, Message};

const SEND_VA: usize = 0x0A00_0000;
const RECV_VA: usize = 0x0B00_0000;

#[test]
fn page_transfer_shares_frame() {
    let (kernel, _console) = boot(KernelConfig::default());
    let a = spawn(&kernel, &standard_image());
    let b = spawn(&kernel, &standard_image());
    let mut env_a = a.env();
    let mut env_b = b.env();

    env_a.sys_mut().page_alloc(exo_abi::Pid::SELF, SEND_VA, RW).unwrap();
    env_a.store(SEND_VA, b"payload for b").unwrap();

    assert_eq!(ipc::recv(&mut env_b, Some(RECV_VA)), Ok(Poll::Pending));
    assert_eq!(kernel.lock().process(b.pid()).unwrap().status, ProcStatus::NotRunnable);

    ipc::send(&mut env_a, b.pid(), 42, Some((SEND_VA, RW))).unwrap();
    assert_eq!(
        ipc::recv(&mut env_b, Some(RECV_VA)),
        Ok(Poll::Ready(Message { value: 42, from: a.pid(), perm: RW }))
    );

    let mut seen = [0u8; 13];
    env_b.load(RECV_VA, &mut seen).unwrap();
    assert_eq!(&seen, b"payload for b");

    let k = kernel.lock();
    let sent = k.lookup(a.pid(), SEND_VA).unwrap();
    let received = k.lookup(b.pid(), RECV_VA).unwrap();
    assert_eq!(sent.frame, received.frame);
    assert_eq!(k.frames().refcount(sent.frame), 2);
    assert_eq!(k.process(b.pid()).unwrap().status, ProcStatus::Runnable);
}

#[test]
fn value_only_send_to_page_receiver() {
    let (kernel, _console) = boot(KernelConfig::default());
    let a = spawn(&kernel, &standard_image());
    let b = spawn(&kernel, &standard_image());
    let mut env_a = a.env();
    let mut env_b = b.env();

    assert_eq!(ipc::recv(&mut env_b, Some(RECV_VA)), Ok(Poll::Pending));
    ipc::send(&mut env_a, b.pid(), 7, None).unwrap();
    assert_eq!(
        ipc::recv(&mut env_b, Some(RECV_VA)),
        Ok(Poll::Ready(Message { value: 7, from: a.pid(), perm: Perm::empty() }))
    );
    assert!(kernel.lock().lookup(b.pid(), RECV_VA).is_none());
}

#[test]
fn send_to_idle_process_is_refused() {
    let (kernel, _console) = boot(KernelConfig::default());
    let mut a = spawn(&kernel, &standard_image());
    let b = spawn(&kernel, &standard_image());
    assert_eq!(a.ipc_try_send(b.pid(), 1, UTOP, Perm::empty()), Err(Error::IpcNotReceiving));
}

#[test]
fn one_of_two_senders_wins() {
    let (kernel, _console) = boot(KernelConfig::default());
    let mut a = spawn(&kernel, &standard_image());
    let mut b = spawn(&kernel, &standard_image());
    let c = spawn(&kernel, &standard_image());
    let mut env_c = c.env();

    assert_eq!(ipc::recv(&mut env_c, None), Ok(Poll::Pending));
    assert_eq!(a.ipc_try_send(c.pid(), 1, UTOP, Perm::empty()), Ok(()));
    assert_eq!(b.ipc_try_send(c.pid(), 2, UTOP, Perm::empty()), Err(Error::IpcNotReceiving));
    assert_eq!(
        ipc::recv(&mut env_c, None),
        Ok(Poll::Ready(Message { value: 1, from: a.pid(), perm: Perm::empty() }))
    );
}

#[test]
fn concurrent_senders_race_for_one_receiver() {
    let (kernel, _console) = boot(KernelConfig::default());
    let senders = [spawn(&kernel, &standard_image()), spawn(&kernel, &standard_image())];
    let receiver = spawn(&kernel, &standard_image());
    let mut env_r = receiver.env();
    assert_eq!(ipc::recv(&mut env_r, None), Ok(Poll::Pending));

    let barrier = Arc::new(Barrier::new(senders.len()));
    let handles: Vec<_> = senders
        .iter()
        .cloned()
        .enumerate()
        .map(|(i, mut task)| {
            let barrier = barrier.clone();
            let to = receiver.pid();
            thread::spawn(move || {
                barrier.wait();
                (task.pid(), task.ipc_try_send(to, 100 + i, UTOP, Perm::empty()))
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let winners: Vec<_> = results.iter().filter(|(_, r)| r.is_ok()).collect();
    assert_eq!(winners.len(), 1);
    let losers: Vec<_> = results.iter().filter(|(_, r)| r.is_err()).collect();
    assert_eq!(losers.len(), 1);
    assert_eq!(losers[0].1, Err(Error::IpcNotReceiving));

    let Ok(Poll::Ready(message)) = ipc::recv(&mut env_r, None) else {
        panic!("receiver should have a message");
    };
    assert_eq!(message.from, winners[0].0);
}
