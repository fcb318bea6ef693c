use cluster_util::local::run_local;
use cluster_util::{ClusterSync, MessageHandler, PubSub};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Keeps `(publisher, sequence)` of every message
#[derive(Default)]
struct Recorder {
    msgs: Vec<(u8, u32)>,
}

impl MessageHandler for Recorder {
    fn on_message(&mut self, m: &[u8]) {
        let mut seq = [0u8; 4];
        seq.copy_from_slice(&m[1..5]);
        self.msgs.push((m[0], u32::from_le_bytes(seq)));
    }
}

#[test]
fn all_subscribers_see_every_message_in_publisher_order() -> anyhow::Result<()> {
    const NMSG: u32 = 200;

    let results = run_local(3, |ep| {
        let rank = ep.rank();
        let is_pub = rank < 2;
        let mut ch = PubSub::open(&ep, 7, is_pub, true, Recorder::default())?;
        assert_eq!(ch.publishers(), &[0, 1]);
        assert_eq!(ch.subscribers(), &[0, 1, 2]);

        if is_pub {
            for i in 0..NMSG {
                let mut m = vec![rank as u8];
                m.extend_from_slice(&i.to_le_bytes());
                ch.publish(&m)?;
            }
        }
        ch.barrier()?;
        let got = ch.handler().msgs.clone();
        Ok(got)
    })?;

    for res in results {
        let got = res?;
        assert_eq!(got.len(), 2 * NMSG as usize);
        for p in 0..2u8 {
            let seq: Vec<u32> = got.iter().filter(|(q, _)| *q == p).map(|x| x.1).collect();
            assert_eq!(seq, (0..NMSG).collect::<Vec<_>>());
        }
    }
    Ok(())
}

#[test]
fn channels_are_demultiplexed_by_id() -> anyhow::Result<()> {
    let results = run_local(2, |ep| {
        let sum_a = Arc::new(AtomicU64::new(0));
        let sum_b = Arc::new(AtomicU64::new(0));
        let (sa, sb) = (sum_a.clone(), sum_b.clone());

        let mut a = PubSub::open(&ep, 1, true, true, move |m: &[u8]| {
            sa.fetch_add(m[0] as u64, Ordering::SeqCst);
        })?;
        let mut b = PubSub::open(&ep, 2, true, true, move |m: &[u8]| {
            sb.fetch_add(m[0] as u64, Ordering::SeqCst);
        })?;
        for _ in 0..10 {
            a.publish(&[1])?;
            b.publish(&[100])?;
        }
        a.barrier()?;
        b.barrier()?;
        Ok((sum_a.load(Ordering::SeqCst), sum_b.load(Ordering::SeqCst)))
    })?;

    for res in results {
        assert_eq!(res?, (20, 2000));
    }
    Ok(())
}

#[test]
fn each_barrier_flushes_its_round() -> anyhow::Result<()> {
    let results = run_local(4, |ep| {
        let rank = ep.rank();
        let is_sub = rank % 2 == 0;
        let mut ch = PubSub::open(&ep, 3, true, is_sub, Recorder::default())?;
        let mut seen = vec![];
        for round in 0..5u32 {
            let mut m = vec![rank as u8];
            m.extend_from_slice(&round.to_le_bytes());
            ch.publish(&m)?;
            ch.barrier()?;
            seen.push(ch.handler().msgs.len());
            // hold the next round back until everyone has looked
            ep.barrier()?;
        }
        Ok((is_sub, seen))
    })?;

    for res in results {
        let (is_sub, seen) = res?;
        if is_sub {
            assert_eq!(seen, vec![4, 8, 12, 16, 20]);
        } else {
            assert_eq!(seen, vec![0; 5]);
        }
    }
    Ok(())
}

#[test]
fn only_publishers_may_publish() -> anyhow::Result<()> {
    let results = run_local(2, |ep| {
        let mut ch = PubSub::open(&ep, 9, ep.rank() == 0, true, |_: &[u8]| {})?;
        let denied = ep.rank() == 1 && ch.publish(b"x").is_err();
        ch.barrier()?;
        Ok(denied)
    })?;

    let denied: Vec<bool> = results.into_iter().collect::<anyhow::Result<_>>()?;
    assert_eq!(denied, vec![false, true]);
    Ok(())
}

#[test]
fn reopening_an_open_channel_fails() -> anyhow::Result<()> {
    let results = run_local(1, |ep| {
        let _ch = PubSub::open(&ep, 5, true, true, |_: &[u8]| {})?;
        Ok(PubSub::open(&ep, 5, true, true, |_: &[u8]| {}).is_err())
    })?;
    for res in results {
        assert!(res?);
    }
    Ok(())
}
