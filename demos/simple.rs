use std::collections::HashMap;

use async_trait::async_trait;
use tickload_rs::{BatchFunction, BatchLoaderEnvironment, DataLoader, Scheduler};

// Functor that implements the BatchFunction trait. For this example, it trivially loads values
// from some HashMap.
struct MyBatchFn {
    movies: HashMap<i64, String>,
}

#[async_trait]
impl BatchFunction<i64, String> for MyBatchFn {
    async fn load(
        &self,
        keys: &[i64],
        env: &BatchLoaderEnvironment<i64>,
    ) -> anyhow::Result<HashMap<i64, String>> {
        println!("tick {}: loading {:?}", env.tick().index, keys);
        Ok(keys.iter().filter_map(|k| self.movies.get(k).cloned().map(|v| (*k, v))).collect())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut movies = HashMap::new();
    movies.insert(2001, "a space odyssey".to_owned());
    movies.insert(7, "samurai".to_owned());
    movies.insert(12, "angry men".to_owned());

    let scheduler = Scheduler::new();
    let loader = DataLoader::new(MyBatchFn { movies }, &scheduler);

    // Loads issued by concurrent work of the same scheduler are coalesced into one call.
    let (samurai, missing, many) = scheduler
        .run({
            let loader = loader.clone();
            async move {
                let many = loader.load_many(vec![12, 2010, 2001]);
                futures::join!(loader.load(7), loader.load(15), many)
            }
        })
        .await?;

    assert_eq!(samurai?.as_deref(), Some("samurai"));
    assert_eq!(missing?, None);
    assert_eq!(
        many?.iter().map(Option::as_deref).collect::<Vec<_>>(),
        vec![Some("angry men"), None, Some("a space odyssey")]
    );

    // Cached keys resolve without another call.
    assert_eq!(loader.load(7).await?.as_deref(), Some("samurai"));
    scheduler.drained().await;
    Ok(())
}
