#![cfg(any(loom, spark_loom))]
//! 配额记账器的 Loom 并发模型。
//!
//! 运行方式：`RUSTFLAGS="--cfg spark_loom" cargo test -p spark-spool --features loom-model --test loom_accountant`。

use loom::{model, sync::Arc, thread};
use spark_spool::{ResourceAccountant, ResourceKind};

#[test]
fn racing_grants_split_the_quota_exactly() {
    // 两个线程各申请 60，总配额 100：无论交错如何，先到者拿满 60，后到者只拿到剩余的 40。
    model(|| {
        let accountant = Arc::new(ResourceAccountant::new(ResourceKind::Memory, 100, 1, 64));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let accountant = Arc::clone(&accountant);
                thread::spawn(move || accountant.register(60).granted())
            })
            .collect();
        let mut grants: Vec<usize> = handles
            .into_iter()
            .map(|handle| handle.join().expect("线程不应 panic"))
            .collect();
        grants.sort_unstable();
        assert_eq!(grants, vec![40, 60]);
        assert_eq!(accountant.remaining(), 0);

        for amount in grants {
            accountant.unregister(amount);
        }
        assert_eq!(accountant.remaining(), 100);
    });
}

#[test]
fn reload_racing_with_register_preserves_balance() {
    model(|| {
        let accountant = Arc::new(ResourceAccountant::new(ResourceKind::Disk, 100, 1, 64));
        let taker = {
            let accountant = Arc::clone(&accountant);
            thread::spawn(move || accountant.register(64).granted())
        };
        let reloader = {
            let accountant = Arc::clone(&accountant);
            thread::spawn(move || accountant.reload(50))
        };
        let granted = taker.join().expect("申请线程不应 panic");
        assert_eq!(reloader.join().expect("热更新线程不应 panic"), 100);

        assert!(granted == 64 || granted == 50);
        let snapshot = accountant.snapshot();
        assert_eq!(snapshot.total, 50);
        assert_eq!(snapshot.remaining + granted as i64, 50);
    });
}
