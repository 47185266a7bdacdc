/// Callback interface supplied by the sending application.
pub trait SendEventNotifier: Send + Sync {
    /// Called when a product leaves the retransmission cache, either because
    /// every receiver confirmed complete reception or because the product's
    /// retransmission lifetime expired - whichever happens first. At most
    /// one call per product.
    fn notify_of_eop(&self, prodindex: u32);
}
