// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

pub use conservator::*;


// These tests live outside the library so they can only reach the public API:
// a cluster of partitions wired together with in-memory pipes, driven the way
// an embedding process would drive it.

#[test]
fn remote_read_test() {
    test::remote_read_test();
}

#[test]
fn remote_write_only_test() {
    test::remote_write_only_test();
}

#[test]
fn read_only_master_test() {
    test::read_only_master_test();
}

#[test]
fn multi_txn_test() {
    test::multi_txn_test();
}

pub fn main() {
    println!("please run `cargo test` instead");
}
