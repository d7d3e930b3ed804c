// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Copy-on-write fork driven by the user library against the kernel
//! INTENT: Writable pages become COW in both processes; read-only pages stay shared;
//!         a write after fork yields private frames with identical prior contents
//! TESTS: mapping permissions after fork; child write; parent write; child identity

use exo::KernelConfig;
use exo_abi::layout::{PAGE_SIZE, USTACKTOP, UXSTACKTOP};
use exo_abi::{Perm, Pid, ProcStatus};
use exo_e2e::{boot, spawn, standard_image, Task, DATA_INIT, DATA_VA, RODATA_INIT, RODATA_VA, RO};
use exo_ulib::{fork, Env};

const COW: Perm = Perm::PRESENT.union(Perm::USER).union(Perm::COW);

fn forked() -> (exo_e2e::SharedKernel, Env<Task>, Env<Task>) {
    let (kernel, _console) = boot(KernelConfig::default());
    let parent = spawn(&kernel, &standard_image());
    let mut env_p = parent.env();
    let child = fork(&mut env_p).unwrap();
    assert_ne!(child, Pid::SELF);

    // The child starts from a copy of the parent's runtime and resumes inside fork.
    let mut env_c = Env::with_runtime(Task::new(kernel.clone(), child), env_p.runtime());
    assert_eq!(fork(&mut env_c), Ok(Pid::SELF));
    assert_eq!(env_c.this_env(), child);
    (kernel, env_p, env_c)
}

#[test]
fn mappings_after_fork() {
    let (kernel, env_p, env_c) = forked();
    let (p, c) = (env_p.this_env(), env_c.this_env());
    let k = kernel.lock();

    for pid in [p, c] {
        assert_eq!(k.lookup(pid, DATA_VA).unwrap().perm, COW);
        assert_eq!(k.lookup(pid, USTACKTOP - PAGE_SIZE).unwrap().perm, COW);
        assert_eq!(k.lookup(pid, RODATA_VA).unwrap().perm, RO);
        assert_eq!(k.process(pid).unwrap().status, ProcStatus::Runnable);
    }
    assert_eq!(k.lookup(p, DATA_VA).unwrap().frame, k.lookup(c, DATA_VA).unwrap().frame);
    assert_eq!(k.lookup(p, RODATA_VA).unwrap().frame, k.lookup(c, RODATA_VA).unwrap().frame);

    // Exception stacks are private.
    let xstack = UXSTACKTOP - PAGE_SIZE;
    assert_ne!(k.lookup(p, xstack).unwrap().frame, k.lookup(c, xstack).unwrap().frame);
    assert_eq!(k.process(c).unwrap().parent, Some(p));
    assert_eq!(k.process(c).unwrap().fault_upcall, k.process(p).unwrap().fault_upcall);
}

#[test]
fn child_write_gets_private_copy() {
    let (kernel, mut env_p, mut env_c) = forked();
    let (p, c) = (env_p.this_env(), env_c.this_env());
    let shared = kernel.lock().lookup(p, DATA_VA).unwrap().frame;
    assert_eq!(kernel.lock().frames().refcount(shared), 2);

    env_c.store(DATA_VA, b"CHILD").unwrap();

    {
        let k = kernel.lock();
        let mine = k.lookup(c, DATA_VA).unwrap();
        assert_ne!(mine.frame, shared);
        assert!(mine.perm.contains(Perm::WRITE));
        assert!(!mine.perm.contains(Perm::COW));
        assert_eq!(k.lookup(p, DATA_VA).unwrap().frame, shared);
        assert_eq!(k.frames().refcount(shared), 1);
        assert!(k.lookup(c, exo_abi::layout::PFTEMP).is_none());
        assert_eq!(k.lookup(p, RODATA_VA).unwrap().frame, k.lookup(c, RODATA_VA).unwrap().frame);
    }

    let mut child_view = [0u8; DATA_INIT.len()];
    env_c.load(DATA_VA, &mut child_view).unwrap();
    assert_eq!(&child_view[..5], b"CHILD");
    assert_eq!(&child_view[5..], &DATA_INIT[5..]);

    let mut parent_view = [0u8; DATA_INIT.len()];
    env_p.load(DATA_VA, &mut parent_view).unwrap();
    assert_eq!(&parent_view, DATA_INIT);

    let mut ro = [0u8; RODATA_INIT.len()];
    env_c.load(RODATA_VA, &mut ro).unwrap();
    assert_eq!(&ro, RODATA_INIT);
}

#[test]
fn parent_write_after_fork_is_private_too() {
    let (kernel, mut env_p, mut env_c) = forked();
    env_p.store(DATA_VA + 7, b"!").unwrap();

    let mut child_view = [0u8; DATA_INIT.len()];
    env_c.load(DATA_VA, &mut child_view).unwrap();
    assert_eq!(&child_view, DATA_INIT);

    let k = kernel.lock();
    let p = k.lookup(env_p.this_env(), DATA_VA).unwrap();
    let c = k.lookup(env_c.this_env(), DATA_VA).unwrap();
    assert_ne!(p.frame, c.frame);
    // The child still maps the shared frame copy-on-write until it writes.
    assert_eq!(c.perm, COW);
}

#[test]
fn child_can_print_from_cow_stack() {
    let (kernel, console) = boot(KernelConfig::default());
    let parent = spawn(&kernel, &standard_image());
    let mut env_p = parent.env();
    let child = fork(&mut env_p).unwrap();
    let mut env_c = Env::with_runtime(Task::new(kernel.clone(), child), env_p.runtime());
    assert_eq!(fork(&mut env_c), Ok(Pid::SELF));

    env_c.print("hello from child\n").unwrap();
    assert!(console.output_string().contains("hello from child"));
}

#[test]
fn write_to_read_only_page_is_fatal() {
    let (kernel, console) = boot(KernelConfig::default());
    let parent = spawn(&kernel, &standard_image());
    let mut env_p = parent.env();
    let pid = env_p.this_env();
    exo_ulib::set_pgfault_handler(&mut env_p, exo_ulib::cow_fault).unwrap();

    assert_eq!(env_p.store(RODATA_VA, b"x"), Err(exo_ulib::UserError::Fatal));
    assert!(kernel.lock().process(pid).is_none());
    assert!(console.output_string().contains("user panic: unexpected fault"));
}
