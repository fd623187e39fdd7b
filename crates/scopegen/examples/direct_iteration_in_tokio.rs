//! Consumes the same kind of producer twice: once by iterating the adapter
//! directly, once inside a scope that stops early.

use futures::TryStreamExt;
use scopegen::{Error, Generator, ProducerExt, ScopedStream};
use std::time::Duration;

fn ticks(count: u32) -> Generator<'static, u32, String> {
    Generator::new(move |co| async move {
        println!("[ticks] connection opened");
        co.defer(async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            println!("[ticks] connection closed");
            Ok(())
        });
        for tick in 0..count {
            tokio::time::sleep(Duration::from_millis(1)).await;
            co.yield_(tick).await;
        }
        Ok(())
    })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Error<String>> {
    let mut all = ScopedStream::new(ticks(3));
    let collected: Vec<u32> = all.iter().try_collect().await?;
    println!("direct iteration: {collected:?}");

    let mut some = ScopedStream::new(ticks(100));
    let firsts = some
        .scope(async |producer| {
            let mut firsts = Vec::new();
            while let Some(tick) = producer.next().await {
                let tick = tick.map_err(Error::Producer)?;
                if tick == 2 {
                    break;
                }
                firsts.push(tick);
            }
            Ok::<_, Error<String>>(firsts)
        })
        .await?;
    println!("scoped, stopped early: {firsts:?}");

    Ok(())
}
