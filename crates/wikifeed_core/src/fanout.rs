use std::thread;

/// Runs `task` once per item on its own thread and returns the results in
/// submission order, after every branch has finished.
pub fn join_ordered<T, R, F>(items: Vec<T>, task: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(usize, T) -> R + Sync,
{
    if items.len() <= 1 {
        return items
            .into_iter()
            .enumerate()
            .map(|(index, item)| task(index, item))
            .collect();
    }

    let task = &task;
    thread::scope(|scope| {
        let handles = items
            .into_iter()
            .enumerate()
            .map(|(index, item)| scope.spawn(move || task(index, item)))
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(value) => value,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect()
    })
}
