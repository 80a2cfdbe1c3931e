//! Walkthrough of version-gated writes.

use occ_map::{OccMap, Stamped, WriteOutcome};
use std::sync::Arc;
use std::thread;

fn main() {
    let accounts: Arc<OccMap<&'static str, Stamped<i64>>> = Arc::new(OccMap::new());
    accounts.put("alice", Stamped::initial(100)).unwrap();
    accounts.put("bob", Stamped::initial(50)).unwrap();
    println!("start: {accounts}");

    // Two clerks read the same version and both try to debit alice.
    let seen = accounts.get("alice").unwrap();
    let first = accounts.put("alice", seen.succeed(seen.value - 30).unwrap());
    let second = accounts.try_put("alice", seen.succeed(seen.value - 70).unwrap());
    println!("first clerk: {first:?}");
    match second {
        WriteOutcome::Conflict(c) => println!(
            "second clerk lost: stored {} beats attempted {}",
            c.existing, c.attempted
        ),
        WriteOutcome::Accepted(_) => unreachable!(),
    }

    // Many threads deposit with compare-and-set retries.
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let accounts = accounts.clone();
            thread::spawn(move || {
                for _ in 0..1_000 {
                    loop {
                        let cur = accounts.get("bob").unwrap();
                        let next = cur.succeed(cur.value + 1).unwrap();
                        if accounts.replace_if("bob", &cur, next) {
                            break;
                        }
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    println!("after deposits: {accounts}");

    // Removal ignores versions, so the key starts over.
    accounts.remove("alice");
    accounts.put("alice", Stamped::initial(0)).unwrap();
    println!("end: {accounts} ({} accounts)", accounts.len());
}
