pub mod netif;
