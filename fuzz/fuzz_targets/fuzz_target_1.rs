#![no_main]

use libfuzzer_sys::fuzz_target;
use rand::Rng;
use skipindex::SkipList;
use std::sync::Arc;

fuzz_target!(|data: &[u8]| {
    let list = Arc::new(SkipList::new());

    // Replay the fuzz input on one thread, then churn from many.
    for chunk in data.chunks(2) {
        let key = chunk[0];
        if chunk.len() == 2 && chunk[1] % 5 == 0 {
            list.remove(&key);
        } else {
            list.insert(key, ());
        }
    }

    let threads = (0..8)
        .map(|_| {
            let list = list.clone();
            std::thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..2_000 {
                    let target = rng.gen::<u8>();
                    if rng.gen::<u8>() % 5 == 0 {
                        list.remove(&target);
                    } else {
                        list.insert(target, ());
                    }
                }
            })
        })
        .collect::<Vec<_>>();

    for thread in threads {
        thread.join().unwrap()
    }
});
