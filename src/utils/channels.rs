use futures::Stream;
use tokio::sync::broadcast;

pub type WatchTx<T> = tokio::sync::watch::Sender<T>;
pub type WatchRx<T> = tokio::sync::watch::Receiver<T>;

pub type UnbTx<T> = tokio::sync::mpsc::UnboundedSender<T>;
#[derive(Debug)]
pub struct UnbRx<T> {
    pub inner: tokio::sync::mpsc::UnboundedReceiver<T>,
}
impl<T> UnbRx<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.inner.recv().await
    }
}
const _: () = {
    use tokio::sync::mpsc::UnboundedReceiver;

    impl<T> Stream for UnbRx<T> {
        type Item = T;

        fn poll_next(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Option<Self::Item>> {
            self.inner.poll_recv(cx)
        }

        fn size_hint(&self) -> (usize, Option<usize>) {
            (self.inner.len(), None)
        }
    }

    impl<T> From<UnboundedReceiver<T>> for UnbRx<T> {
        fn from(rx: UnboundedReceiver<T>) -> Self {
            Self { inner: rx }
        }
    }
};
pub fn unb_chan<T>() -> (UnbTx<T>, UnbRx<T>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    (tx, rx.into())
}

/// Lossy stream over a broadcast receiver. Lagged items are skipped with a warning.
#[track_caller]
pub fn broadcast_stream<T: Clone + Send + 'static>(
    rx: broadcast::Receiver<T>,
) -> impl Stream<Item = T> + Send + 'static {
    futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(value) => break Some((value, rx)),
                Err(broadcast::error::RecvError::Closed) => break None,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!(
                        "Lagged {n} items on lossy stream ({})",
                        std::any::type_name::<T>()
                    );
                }
            }
        }
    })
}
