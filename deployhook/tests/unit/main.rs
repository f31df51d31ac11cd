mod test_executor;
mod test_webhook;
